//! Pluggable prompt detection.
//!
//! Command boundaries and agent turns are inferred from text, so every
//! matcher here is a heuristic:
//!
//! - [`ShellIntegrationMatcher`] trusts OSC 133 marks emitted by shells with
//!   integration enabled. Exact when present, silent otherwise.
//! - [`RegexPromptMatcher`] looks for a prompt at the end of the cursor line.
//!   Output that happens to end in a prompt character is a false positive, and
//!   prompts the pattern does not describe are missed.
//! - [`AgentPromptMatcher`] looks for the input prompt of interactive coding
//!   agents. Agents that redraw their prompt while still working produce
//!   early turns.

use regex::Regex;

use crate::scan::Scan;

/// A boundary inferred from output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMark {
    /// A command began executing.
    CommandStarted,
    /// The shell is showing a prompt again, with the previous command's exit
    /// status when the prompt reveals it.
    PromptShown { status: Option<i32> },
    /// An interactive agent is waiting for the user.
    AgentAwaitingInput,
}

/// Turns scanned output into prompt marks.
pub trait PromptMatcher: Send {
    fn name(&self) -> &'static str;

    fn inspect(&mut self, scan: &Scan) -> Vec<PromptMark>;
}

/// OSC 133 ("FinalTerm") shell integration marks.
///
/// `A` prompt start, `C` command output start, `D;<code>` command finished.
#[derive(Debug, Default)]
pub struct ShellIntegrationMatcher;

impl PromptMatcher for ShellIntegrationMatcher {
    fn name(&self) -> &'static str {
        "osc133"
    }

    fn inspect(&mut self, scan: &Scan) -> Vec<PromptMark> {
        scan.osc
            .iter()
            .filter(|params| params.first().map(Vec::as_slice) == Some(b"133".as_slice()))
            .filter_map(|params| {
                let kind = *params.get(1)?.first()?;
                match kind {
                    b'A' => Some(PromptMark::PromptShown { status: None }),
                    b'C' => Some(PromptMark::CommandStarted),
                    b'D' => Some(PromptMark::PromptShown {
                        status: params
                            .get(2)
                            .and_then(|code| std::str::from_utf8(code).ok())
                            .and_then(|code| code.trim().parse().ok()),
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

/// Default prompt pattern: a line ending in `$`, `#`, `%`, `>` or `❯`,
/// optionally showing the last status as `[N]` somewhere before it.
pub const DEFAULT_PROMPT_PATTERN: &str = r"^(?:.*\[(?P<status>\d{1,3})\])?.*[$#%>❯] ?$";

/// Prompt detection by regex on the cursor line.
///
/// Fires once per prompt: after a match it waits for a completed line before
/// it can fire again, so a prompt that is merely redrawn is not reported twice.
#[derive(Debug)]
pub struct RegexPromptMatcher {
    pattern: Regex,
    armed: bool,
}

impl RegexPromptMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            armed: true,
        })
    }
}

impl PromptMatcher for RegexPromptMatcher {
    fn name(&self) -> &'static str {
        "prompt-regex"
    }

    fn inspect(&mut self, scan: &Scan) -> Vec<PromptMark> {
        if !scan.lines.is_empty() {
            self.armed = true;
        }
        if !self.armed || scan.trailing.trim().is_empty() {
            return Vec::new();
        }
        let Some(captures) = self.pattern.captures(&scan.trailing) else {
            return Vec::new();
        };
        self.armed = false;
        let status = captures
            .name("status")
            .and_then(|status| status.as_str().parse().ok());
        vec![PromptMark::PromptShown { status }]
    }
}

/// Input prompts of interactive agents (Claude Code and similar).
pub const DEFAULT_AGENT_PATTERNS: &[&str] = &[
    r"^\s*│\s*>\s*$",
    r"(?i)do you want to (?:proceed|make this edit|create)",
    r"^\s*❯\s*1\.\s*Yes",
];

/// Reports an agent turn when its prompt appears after other output.
#[derive(Debug)]
pub struct AgentPromptMatcher {
    patterns: Vec<Regex>,
    prompt_visible: bool,
}

impl AgentPromptMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            prompt_visible: false,
        })
    }

    fn matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(line))
    }
}

impl PromptMatcher for AgentPromptMatcher {
    fn name(&self) -> &'static str {
        "agent-prompt"
    }

    fn inspect(&mut self, scan: &Scan) -> Vec<PromptMark> {
        if self.patterns.is_empty() {
            return Vec::new();
        }
        let seen = scan.all_lines().any(|line| self.matches(line));
        if seen {
            let newly_visible = !self.prompt_visible;
            self.prompt_visible = true;
            if newly_visible {
                return vec![PromptMark::AgentAwaitingInput];
            }
        } else if scan.printed {
            // Output without the prompt: the agent is working again.
            self.prompt_visible = false;
        }
        Vec::new()
    }
}
