use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::event::{NotificationEvent, NotificationKind, NotificationPayload};
use crate::matcher::{
    AgentPromptMatcher, PromptMark, PromptMatcher, RegexPromptMatcher, ShellIntegrationMatcher,
    DEFAULT_AGENT_PATTERNS, DEFAULT_PROMPT_PATTERN,
};
use crate::scan::OutputScanner;

/// Commands running longer than this produce a completion notification.
pub const DEFAULT_LONG_COMMAND_THRESHOLD: Duration = Duration::from_secs(3);

/// Classifier settings shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    pub long_command_threshold: Duration,
    /// Prompt regex; `None` disables regex prompt detection.
    pub prompt_pattern: Option<String>,
    pub agent_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            long_command_threshold: DEFAULT_LONG_COMMAND_THRESHOLD,
            prompt_pattern: Some(DEFAULT_PROMPT_PATTERN.to_string()),
            agent_patterns: DEFAULT_AGENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ClassifierConfig {
    /// Build the matcher set this configuration describes.
    pub fn build_matchers(&self) -> Result<Vec<Box<dyn PromptMatcher>>, regex::Error> {
        let mut matchers: Vec<Box<dyn PromptMatcher>> = vec![Box::new(ShellIntegrationMatcher)];
        if let Some(pattern) = &self.prompt_pattern {
            matchers.push(Box::new(RegexPromptMatcher::new(pattern)?));
        }
        if !self.agent_patterns.is_empty() {
            matchers.push(Box::new(AgentPromptMatcher::new(&self.agent_patterns)?));
        }
        Ok(matchers)
    }
}

/// Per-session state machine mapping terminal activity to notification events.
///
/// Owns all of its state; classifiers of different sessions share nothing.
/// Every input takes the observation time so behavior does not depend on
/// wall-clock sleeps.
pub struct EventClassifier {
    session_id: String,
    scanner: OutputScanner,
    matchers: Vec<Box<dyn PromptMatcher>>,
    long_command_threshold: Duration,
    started: bool,
    exited: bool,
    at_prompt: bool,
    /// Printable input arrived since the last prompt or submission.
    typed: bool,
    command_started_at: Option<Instant>,
}

impl EventClassifier {
    pub fn new(
        session_id: impl Into<String>,
        matchers: Vec<Box<dyn PromptMatcher>>,
        long_command_threshold: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            scanner: OutputScanner::new(),
            matchers,
            long_command_threshold,
            started: false,
            exited: false,
            at_prompt: false,
            typed: false,
            command_started_at: None,
        }
    }

    pub fn from_config(
        session_id: impl Into<String>,
        config: &ClassifierConfig,
    ) -> Result<Self, regex::Error> {
        Ok(Self::new(
            session_id,
            config.build_matchers()?,
            config.long_command_threshold,
        ))
    }

    /// The session reached Running.
    pub fn on_running(&mut self) -> Vec<NotificationEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![self.event(NotificationKind::SessionStart, NotificationPayload::None)]
    }

    /// A chunk of PTY output.
    pub fn on_output(&mut self, bytes: &[u8], now: Instant) -> Vec<NotificationEvent> {
        if self.exited {
            return Vec::new();
        }
        let scan = self.scanner.scan(bytes);
        let mut events: Vec<NotificationEvent> = (0..scan.bells)
            .map(|_| self.event(NotificationKind::Bell, NotificationPayload::None))
            .collect();

        let marks: Vec<PromptMark> = self
            .matchers
            .iter_mut()
            .flat_map(|matcher| {
                let marks = matcher.inspect(&scan);
                if !marks.is_empty() {
                    trace!("matcher {} reported {:?}", matcher.name(), marks);
                }
                marks
            })
            .collect();

        for mark in marks {
            match mark {
                PromptMark::CommandStarted => self.start_command(now),
                PromptMark::PromptShown { status } => events.extend(self.prompt_shown(status, now)),
                PromptMark::AgentAwaitingInput => {
                    events.push(self.event(NotificationKind::AgentTurn, NotificationPayload::None))
                }
            }
        }
        events
    }

    /// Input submitted by a client. Enter at a prompt after typing something
    /// starts a command; a bare Enter only redraws the prompt.
    pub fn on_input(&mut self, bytes: &[u8], now: Instant) {
        for byte in bytes {
            match byte {
                b'\r' | b'\n' => {
                    if self.at_prompt && self.typed {
                        self.start_command(now);
                    }
                    self.typed = false;
                }
                0x20..=0x7e => self.typed = true,
                _ => {}
            }
        }
    }

    /// The process exited.
    pub fn on_exit(&mut self, exit_code: i32) -> Vec<NotificationEvent> {
        if self.exited {
            return Vec::new();
        }
        self.exited = true;
        self.command_started_at = None;
        vec![self.event(
            NotificationKind::SessionExit,
            NotificationPayload::ExitCode { code: exit_code },
        )]
    }

    /// A command is currently believed to be running.
    pub fn command_running(&self) -> bool {
        self.command_started_at.is_some()
    }

    fn start_command(&mut self, now: Instant) {
        self.at_prompt = false;
        if self.command_started_at.is_none() {
            debug!("session {}: command started", self.session_id);
            self.command_started_at = Some(now);
        }
    }

    fn prompt_shown(&mut self, status: Option<i32>, now: Instant) -> Vec<NotificationEvent> {
        self.at_prompt = true;
        self.typed = false;
        let mut events = Vec::new();
        // Without a started command, a status in the prompt is stale.
        let Some(started) = self.command_started_at.take() else {
            return events;
        };
        let elapsed = now.saturating_duration_since(started);

        if let Some(code) = status.filter(|code| *code != 0) {
            events.push(self.event(
                NotificationKind::CommandError,
                NotificationPayload::ExitCode { code },
            ));
        }
        debug!(
            "session {}: command finished after {:?} (status {:?})",
            self.session_id, elapsed, status
        );
        if elapsed > self.long_command_threshold {
            events.push(self.event(
                NotificationKind::CommandCompletion,
                NotificationPayload::elapsed(elapsed, status),
            ));
        }
        events
    }

    fn event(&self, kind: NotificationKind, payload: NotificationPayload) -> NotificationEvent {
        NotificationEvent::new(kind, &self.session_id, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> EventClassifier {
        EventClassifier::from_config("s1", &ClassifierConfig::default()).unwrap()
    }

    fn kinds(events: &[NotificationEvent]) -> Vec<NotificationKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_session_start_once() {
        let mut c = classifier();
        assert_eq!(kinds(&c.on_running()), vec![NotificationKind::SessionStart]);
        assert!(c.on_running().is_empty());
    }

    #[test]
    fn test_session_exit_once_with_code() {
        let mut c = classifier();
        let events = c.on_exit(0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NotificationKind::SessionExit);
        assert_eq!(events[0].payload, NotificationPayload::ExitCode { code: 0 });
        assert_eq!(events[0].session_id, "s1");
        assert!(c.on_exit(0).is_empty());
    }

    #[test]
    fn test_every_bell_counts() {
        let mut c = classifier();
        let now = Instant::now();
        let events = c.on_output(b"\x07\x07\x07", now);
        assert_eq!(kinds(&events), vec![NotificationKind::Bell; 3]);
        assert_eq!(kinds(&c.on_output(b"\x07", now)), vec![NotificationKind::Bell]);
    }

    #[test]
    fn test_long_command_completion_once() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.on_output(b"$ ", t0);
        c.on_input(b"sleep 5\r", t0);
        assert!(c.command_running());
        assert!(c.on_output(b"sleep 5\r\n", t0).is_empty());

        let events = c.on_output(b"$ ", t0 + Duration::from_secs(5));
        assert_eq!(kinds(&events), vec![NotificationKind::CommandCompletion]);
        assert_eq!(
            events[0].payload,
            NotificationPayload::Elapsed {
                elapsed_ms: 5000,
                exit_code: None
            }
        );
        // A redrawn prompt does not complete anything again.
        assert!(c.on_output(b"\r$ ", t0 + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn test_short_command_is_silent() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.on_output(b"$ ", t0);
        c.on_input(b"true\n", t0);
        c.on_output(b"true\r\n", t0);
        let events = c.on_output(b"$ ", t0 + Duration::from_millis(400));
        assert!(events.is_empty());
        assert!(!c.command_running());
    }

    #[test]
    fn test_enter_away_from_prompt_starts_nothing() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.on_output(b"Password: ", t0);
        c.on_input(b"\r", t0);
        assert!(!c.command_running());
    }

    #[test]
    fn test_nonzero_status_is_command_error() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.on_output(b"$ ", t0);
        c.on_input(b"false\r", t0);
        c.on_output(b"false\r\n", t0);
        let events = c.on_output(b"[1] $ ", t0 + Duration::from_millis(10));
        assert_eq!(kinds(&events), vec![NotificationKind::CommandError]);
        assert_eq!(events[0].payload, NotificationPayload::ExitCode { code: 1 });
    }

    #[test]
    fn test_stale_status_prompt_is_not_an_error() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.on_output(b"$ ", t0);
        c.on_input(b"false\r", t0);
        c.on_output(b"false\r\n", t0);
        let events = c.on_output(b"[1] $ ", t0);
        assert_eq!(kinds(&events), vec![NotificationKind::CommandError]);

        // Enter on an empty line redraws the same status prompt.
        c.on_input(b"\r", t0);
        assert!(!c.command_running());
        assert!(c.on_output(b"\r\n[1] $ ", t0).is_empty());
    }

    #[test]
    fn test_one_failure_reported_once_by_two_matchers() {
        let mut c = classifier();
        let t0 = Instant::now();
        assert!(c.on_output(b"\x1b]133;A\x07[0] $ ", t0).is_empty());
        c.on_input(b"false\r", t0);
        c.on_output(b"false\r\n\x1b]133;C\x07", t0);
        let events = c.on_output(
            b"\x1b]133;D;1\x07\x1b]133;A\x07[1] $ ",
            t0 + Duration::from_millis(10),
        );
        assert_eq!(kinds(&events), vec![NotificationKind::CommandError]);
    }

    #[test]
    fn test_shell_integration_long_failure() {
        let matchers: Vec<Box<dyn PromptMatcher>> = vec![Box::new(ShellIntegrationMatcher)];
        let mut c = EventClassifier::new("s2", matchers, DEFAULT_LONG_COMMAND_THRESHOLD);
        let t0 = Instant::now();
        c.on_output(b"\x1b]133;A\x07$ \x1b]133;C\x07", t0);
        let events = c.on_output(
            b"build failed\r\n\x1b]133;D;2\x07\x1b]133;A\x07$ ",
            t0 + Duration::from_secs(10),
        );
        assert_eq!(
            kinds(&events),
            vec![NotificationKind::CommandError, NotificationKind::CommandCompletion]
        );
        assert_eq!(
            events[1].payload,
            NotificationPayload::Elapsed {
                elapsed_ms: 10_000,
                exit_code: Some(2)
            }
        );
    }

    #[test]
    fn test_agent_turn() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.on_output(b"Reading files...\r\n", t0);
        let events = c.on_output(b"Do you want to proceed?\r\n", t0);
        assert_eq!(kinds(&events), vec![NotificationKind::AgentTurn]);
    }

    #[test]
    fn test_nothing_after_exit() {
        let mut c = classifier();
        c.on_exit(1);
        assert!(c.on_output(b"\x07", Instant::now()).is_empty());
    }

    #[test]
    fn test_classifiers_are_independent() {
        let mut a = classifier();
        let mut b = EventClassifier::from_config("s2", &ClassifierConfig::default()).unwrap();
        let t0 = Instant::now();
        a.on_output(b"$ ", t0);
        a.on_input(b"make\r", t0);
        assert!(a.command_running());
        assert!(!b.command_running());
        assert!(b.on_output(b"$ ", t0 + Duration::from_secs(9)).is_empty());
    }
}
