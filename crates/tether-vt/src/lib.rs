//! tether-vt: the terminal buffer behind every tether session.
//!
//! Provides a revisioned API over `alacritty_terminal`: PTY output goes in,
//! immutable [`Frame`]s, [`Snapshot`]s and row-level [`FrameDiff`]s come out.
//! Full VT/xterm parsing is delegated to alacritty.

pub mod cell;
pub mod frame;
pub mod screen;
pub mod terminal;

pub use cell::{Cell, CellFlags, Rgb};
pub use frame::{ChangedLine, DiffMismatch, Frame, FrameDiff, Line, Snapshot};
pub use screen::{CursorShape, CursorState, ScreenView};
pub use terminal::{BufferConfig, BufferError, TerminalBuffer};
