use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::term::{Config, Term};
use alacritty_terminal::vte::ansi;

use crate::frame::{Frame, FrameDiff, Snapshot};
use crate::screen::{convert_cursor_shape, CursorState, ScreenView};

/// Terminal geometry was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("invalid geometry {cols}x{rows}: columns and rows must be positive")]
    InvalidGeometry { cols: u16, rows: u16 },
}

/// Sizing knobs for a [`TerminalBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Scrollback rows kept above the screen; the oldest are evicted first.
    pub scrollback_lines: usize,
    /// Recently materialized frames kept for `diff_since`.
    pub frame_history: usize,
    /// Scrollback rows included in a snapshot.
    pub snapshot_history: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: 10_000,
            frame_history: 16,
            snapshot_history: 500,
        }
    }
}

/// State captured from terminal events while parsing.
#[derive(Default)]
struct EventState {
    title: Option<String>,
    pty_writes: Vec<String>,
}

/// Event proxy that captures terminal events.
///
/// `Term` requires `T: EventListener + Clone`, hence the shared state.
#[derive(Clone)]
pub struct EventProxy {
    state: Arc<Mutex<EventState>>,
}

impl EventProxy {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EventState::default())),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EventState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        self.with_state(|state| match event {
            Event::Title(title) => state.title = Some(title),
            Event::ResetTitle => state.title = None,
            Event::PtyWrite(data) => state.pty_writes.push(data),
            _ => {}
        });
    }
}

struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl Dimensions for TermSize {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

/// The single source of truth for what a session's terminal shows.
///
/// Wraps `alacritty_terminal::Term` and its VTE parser. Every mutation bumps
/// [`revision`](Self::revision); readers take immutable [`Frame`]s so they
/// never observe a half-applied chunk.
pub struct TerminalBuffer {
    term: Term<EventProxy>,
    parser: ansi::Processor,
    event_proxy: EventProxy,
    config: BufferConfig,
    revision: u64,
    /// Frames handed out recently, oldest first. The last one matches
    /// `revision` unless the buffer mutated since.
    frames: VecDeque<Arc<Frame>>,
}

impl TerminalBuffer {
    /// Create a buffer with the given geometry.
    pub fn new(cols: u16, rows: u16, config: BufferConfig) -> Result<Self, BufferError> {
        validate_geometry(cols, rows)?;

        let term_config = Config {
            scrolling_history: config.scrollback_lines,
            ..Config::default()
        };
        let size = TermSize {
            columns: cols as usize,
            screen_lines: rows as usize,
        };
        let event_proxy = EventProxy::new();
        let term = Term::new(term_config, &size, event_proxy.clone());

        Ok(Self {
            term,
            parser: ansi::Processor::new(),
            event_proxy,
            config,
            revision: 0,
            frames: VecDeque::with_capacity(config.frame_history.max(1)),
        })
    }

    /// Feed raw PTY output into the terminal.
    ///
    /// Escape sequences split across calls are held by the parser until the
    /// next chunk completes them. Returns the new revision.
    pub fn apply_output(&mut self, bytes: &[u8]) -> u64 {
        if bytes.is_empty() {
            return self.revision;
        }
        self.parser.advance(&mut self.term, bytes);
        self.revision += 1;
        self.revision
    }

    /// Resize the grid, reflowing wrapped rows. Shrinking may drop content.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<u64, BufferError> {
        validate_geometry(cols, rows)?;
        self.term.resize(TermSize {
            columns: cols as usize,
            screen_lines: rows as usize,
        });
        self.revision += 1;
        Ok(self.revision)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn cols(&self) -> u16 {
        self.term.columns() as u16
    }

    pub fn rows(&self) -> u16 {
        self.term.screen_lines() as u16
    }

    /// Read-only access to the live grid.
    pub fn screen(&self) -> ScreenView<'_> {
        ScreenView::new(&self.term)
    }

    /// Current cursor position, shape and visibility.
    pub fn cursor(&self) -> CursorState {
        let content = self.term.renderable_content();
        let cursor = &content.cursor;
        let row = cursor.point.line.0.max(0) as u16;
        CursorState {
            row,
            col: cursor.point.column.0 as u16,
            shape: convert_cursor_shape(cursor.shape),
            visible: cursor.shape != ansi::CursorShape::Hidden,
        }
    }

    /// Window title set through OSC 0/2, if any.
    pub fn title(&self) -> Option<String> {
        self.event_proxy.with_state(|state| state.title.clone())
    }

    /// Drain replies the terminal wants written back to the PTY
    /// (cursor position reports, device attributes).
    pub fn take_pty_writes(&mut self) -> Vec<String> {
        self.event_proxy
            .with_state(|state| std::mem::take(&mut state.pty_writes))
    }

    /// The visible screen at the current revision.
    ///
    /// Frames are cached, so calling this repeatedly without intervening
    /// mutations returns the same `Arc`.
    pub fn frame(&mut self) -> Arc<Frame> {
        if let Some(last) = self.frames.back() {
            if last.revision == self.revision {
                return Arc::clone(last);
            }
        }

        let frame = Arc::new(self.build_frame());
        if self.frames.len() >= self.config.frame_history.max(1) {
            self.frames.pop_front();
        }
        self.frames.push_back(Arc::clone(&frame));
        frame
    }

    /// Current frame plus the most recent scrollback rows.
    pub fn snapshot(&mut self) -> Snapshot {
        let frame = (*self.frame()).clone();
        let screen = self.screen();
        let available = screen.history_len();
        let start = available.saturating_sub(self.config.snapshot_history);
        let history = (start..available)
            .filter_map(|index| screen.history_line(index))
            .collect();
        Snapshot { frame, history }
    }

    /// Row-level changes from `revision` to the current revision.
    ///
    /// `None` means the base frame is no longer retained (or the geometry has
    /// changed since), and the caller must resync from a snapshot.
    pub fn diff_since(&mut self, revision: u64) -> Option<FrameDiff> {
        let current = self.frame();
        let base = self.frames.iter().find(|frame| frame.revision == revision)?;
        base.diff_to(&current)
    }

    fn build_frame(&self) -> Frame {
        let screen = self.screen();
        let rows = screen.rows();
        Frame {
            revision: self.revision,
            cols: screen.cols(),
            rows,
            lines: (0..rows).map(|row| screen.line(row)).collect(),
            cursor: self.cursor(),
            title: self.title(),
        }
    }
}

fn validate_geometry(cols: u16, rows: u16) -> Result<(), BufferError> {
    if cols == 0 || rows == 0 {
        return Err(BufferError::InvalidGeometry { cols, rows });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellFlags;

    fn buffer(cols: u16, rows: u16) -> TerminalBuffer {
        TerminalBuffer::new(cols, rows, BufferConfig::default()).unwrap()
    }

    #[test]
    fn test_create_buffer_dimensions() {
        let term = buffer(80, 24);
        assert_eq!(term.cols(), 80);
        assert_eq!(term.rows(), 24);
        assert_eq!(term.revision(), 0);
    }

    #[test]
    fn test_zero_geometry_rejected_on_create() {
        assert!(matches!(
            TerminalBuffer::new(0, 24, BufferConfig::default()),
            Err(BufferError::InvalidGeometry { cols: 0, rows: 24 })
        ));
    }

    #[test]
    fn test_write_hello() {
        let mut term = buffer(80, 24);
        term.apply_output(b"hello");

        let screen = term.screen();
        assert_eq!(screen.cell(0, 0).codepoint, 'h');
        assert_eq!(screen.cell(0, 4).codepoint, 'o');
        assert_eq!(screen.cell(0, 5).codepoint, ' ');
        assert_eq!(screen.line(0).text(), "hello");
    }

    #[test]
    fn test_revision_increments_per_mutation() {
        let mut term = buffer(80, 24);
        assert_eq!(term.apply_output(b"a"), 1);
        assert_eq!(term.apply_output(b"b"), 2);
        assert_eq!(term.apply_output(b""), 2);
        assert_eq!(term.resize(100, 30).unwrap(), 3);
    }

    #[test]
    fn test_ansi_color_escape() {
        let mut term = buffer(80, 24);
        term.apply_output(b"\x1b[31mR");

        let cell = term.screen().cell(0, 0);
        assert_eq!(cell.codepoint, 'R');
        assert_ne!(cell.fg, crate::cell::DEFAULT_FG);
    }

    #[test]
    fn test_bold_flag() {
        let mut term = buffer(80, 24);
        term.apply_output(b"\x1b[1mB");
        let cell = term.screen().cell(0, 0);
        assert!(cell.flags.contains(CellFlags::BOLD));
    }

    #[test]
    fn test_resize_terminal() {
        let mut term = buffer(80, 24);
        term.resize(120, 40).unwrap();
        assert_eq!(term.cols(), 120);
        assert_eq!(term.rows(), 40);
    }

    #[test]
    fn test_resize_zero_leaves_geometry_unchanged() {
        let mut term = buffer(80, 24);
        term.apply_output(b"keep");
        let before = term.revision();

        let err = term.resize(0, 24).unwrap_err();
        assert_eq!(err, BufferError::InvalidGeometry { cols: 0, rows: 24 });
        assert_eq!(term.cols(), 80);
        assert_eq!(term.rows(), 24);
        assert_eq!(term.revision(), before);
    }

    #[test]
    fn test_cursor_position_multiline() {
        let mut term = buffer(10, 5);
        term.apply_output(b"0123456789AB");

        let cursor = term.cursor();
        assert_eq!(cursor.row, 1);
        assert_eq!(cursor.col, 2);
        assert!(term.screen().line(0).wrapped);
    }

    #[test]
    fn test_title_change() {
        let mut term = buffer(80, 24);
        term.apply_output(b"\x1b]0;My Terminal\x07");
        assert_eq!(term.title(), Some("My Terminal".to_string()));
        assert_eq!(term.frame().title.as_deref(), Some("My Terminal"));
    }

    #[test]
    fn test_device_status_response() {
        let mut term = buffer(80, 24);
        term.apply_output(b"\x1b[6n");

        let writes = term.take_pty_writes();
        assert!(!writes.is_empty(), "Expected a device status response");
        assert!(writes[0].starts_with("\x1b["));
        assert!(term.take_pty_writes().is_empty());
    }

    #[test]
    fn test_chunking_does_not_change_result() {
        let stream: &[u8] =
            b"$ ls\r\n\x1b[1;32mgreen\x1b[0m plain\r\n\x1b]0;title\x07\x1b[2;5Hmoved\x1b[K\r\n\xe4\xb8\x96\xe7\x95\x8c";

        let mut whole = buffer(20, 6);
        whole.apply_output(stream);
        let expected = whole.frame();

        for split in 1..stream.len() {
            let mut chunked = buffer(20, 6);
            chunked.apply_output(&stream[..split]);
            chunked.apply_output(&stream[split..]);
            assert!(
                chunked.frame().same_content(&expected),
                "split at byte {split} produced a different screen"
            );
        }

        let mut bytewise = buffer(20, 6);
        for byte in stream {
            bytewise.apply_output(std::slice::from_ref(byte));
        }
        assert!(bytewise.frame().same_content(&expected));
    }

    #[test]
    fn test_frame_is_cached_until_mutation() {
        let mut term = buffer(20, 4);
        term.apply_output(b"x");
        let first = term.frame();
        let second = term.frame();
        assert!(Arc::ptr_eq(&first, &second));

        term.apply_output(b"y");
        let third = term.frame();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.revision, 2);
    }

    #[test]
    fn test_diff_since_reproduces_current_frame() {
        let mut term = buffer(20, 4);
        term.apply_output(b"one\r\n");
        let mut local = (*term.frame()).clone();

        term.apply_output(b"two\r\n");
        term.frame();
        term.apply_output(b"three");

        let diff = term.diff_since(local.revision).unwrap();
        local.apply(&diff).unwrap();
        assert_eq!(local, *term.frame());
        assert!(local.contains_text("three"));
    }

    #[test]
    fn test_diff_since_evicted_revision_requires_snapshot() {
        let config = BufferConfig {
            frame_history: 2,
            ..BufferConfig::default()
        };
        let mut term = TerminalBuffer::new(20, 4, config).unwrap();
        term.apply_output(b"a");
        let old = term.frame().revision;
        for chunk in [b"b", b"c", b"d"] {
            term.apply_output(chunk);
            term.frame();
        }
        assert!(term.diff_since(old).is_none());
        assert!(term.diff_since(9_999).is_none());
    }

    #[test]
    fn test_diff_across_resize_requires_snapshot() {
        let mut term = buffer(20, 4);
        term.apply_output(b"a");
        let old = term.frame().revision;
        term.resize(30, 4).unwrap();
        assert!(term.diff_since(old).is_none());
    }

    #[test]
    fn test_scrollback_is_bounded() {
        let config = BufferConfig {
            scrollback_lines: 5,
            snapshot_history: 100,
            ..BufferConfig::default()
        };
        let mut term = TerminalBuffer::new(10, 3, config).unwrap();
        for i in 0..20 {
            term.apply_output(format!("line{i}\r\n").as_bytes());
        }
        let snapshot = term.snapshot();
        assert_eq!(snapshot.history.len(), 5);
        assert!(snapshot.frame.contains_text("line19"));
        assert_eq!(snapshot.history.last().unwrap().text(), "line17");
    }
}
