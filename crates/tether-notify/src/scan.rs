//! Lightweight text view of PTY output for the classifier.
//!
//! The terminal buffer already interprets output for display; this scanner
//! runs its own VTE state machine so the classifier sees bells, OSC strings
//! and plain line text without touching the buffer. State (including a
//! half-received escape sequence and the unfinished line) carries across
//! chunks.

use vte::{Parser, Perform};

/// Longest unfinished line kept before the front is discarded.
const MAX_LINE_CHARS: usize = 4096;

/// Completed lines retained per scan.
const MAX_LINES_PER_SCAN: usize = 64;

/// What one chunk of output contained.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Scan {
    /// BEL bytes seen outside of escape sequences.
    pub bells: usize,
    /// OSC strings, each split on `;`.
    pub osc: Vec<Vec<Vec<u8>>>,
    /// Lines terminated by LF during this chunk.
    pub lines: Vec<String>,
    /// The unfinished line the cursor sits on after the chunk.
    pub trailing: String,
    /// Any printable character was written.
    pub printed: bool,
}

impl Scan {
    /// Completed lines followed by the trailing line.
    pub fn all_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.trailing.as_str()))
    }
}

#[derive(Default)]
struct LineState {
    line: String,
    pending_cr: bool,
    scan: Scan,
}

impl LineState {
    fn commit_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        if self.scan.lines.len() == MAX_LINES_PER_SCAN {
            self.scan.lines.remove(0);
        }
        self.scan.lines.push(line);
        self.pending_cr = false;
    }
}

impl Perform for LineState {
    fn print(&mut self, c: char) {
        if self.pending_cr {
            self.line.clear();
            self.pending_cr = false;
        }
        if self.line.len() >= MAX_LINE_CHARS {
            let cut = self
                .line
                .char_indices()
                .nth(MAX_LINE_CHARS / 2)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.line.drain(..cut);
        }
        self.line.push(c);
        self.scan.printed = true;
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x07 => self.scan.bells += 1,
            b'\n' => self.commit_line(),
            b'\r' => self.pending_cr = true,
            0x08 => {
                self.line.pop();
            }
            _ => {}
        }
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        self.scan
            .osc
            .push(params.iter().map(|param| param.to_vec()).collect());
    }
}

/// Incremental scanner over one session's output.
pub struct OutputScanner {
    parser: Parser,
    state: LineState,
}

impl OutputScanner {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            state: LineState::default(),
        }
    }

    /// Feed one chunk and collect what it contained.
    pub fn scan(&mut self, bytes: &[u8]) -> Scan {
        self.parser.advance(&mut self.state, bytes);
        let mut scan = std::mem::take(&mut self.state.scan);
        // After a bare CR the line is about to be overwritten, but it is
        // still what the screen shows.
        scan.trailing = self.state.line.clone();
        scan
    }
}

impl Default for OutputScanner {
    fn default() -> Self {
        Self::new()
    }
}
