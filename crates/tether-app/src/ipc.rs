//! Wire types for the daemon's TCP surface.
//!
//! Control traffic is JSON, one `ControlRequest` per line and one
//! `ControlResponse` per reply. Attached text subscribers receive JSON lines of
//! [`TextEvent`]; binary subscribers receive length-prefixed bincode
//! [`BinaryEvent`] frames whose cells are packed by [`encode_cell`].

use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tether_notify::{NotificationPreferences, PreferencesPatch};
use tether_pty::{
    ExitStatus, KillReport, SessionId, SessionSummary, Signal, SubscriptionMessage,
    SubscriptionMode,
};
use tether_vt::{Cell, CursorState, Frame, FrameDiff, Line, Snapshot};
use tokio_util::codec::{Decoder, Encoder};

/// Bytes per packed cell.
pub const CELL_SIZE: usize = 16;

/// Largest binary frame accepted or produced (16 MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A request from a client, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Create(CreateSession),
    List,
    /// Exactly one of `text` or `bytes` should be set.
    Input {
        id: SessionId,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        bytes: Option<Vec<u8>>,
    },
    Resize {
        id: SessionId,
        cols: u16,
        rows: u16,
    },
    Signal {
        id: SessionId,
        signal: Signal,
    },
    Kill {
        id: SessionId,
    },
    KillAll,
    Cleanup {
        id: SessionId,
    },
    CleanupAllExited,
    Snapshot {
        id: SessionId,
    },
    Poll {
        id: SessionId,
        since: u64,
    },
    /// Turns the connection into a subscription stream.
    Attach {
        id: SessionId,
        mode: SubscriptionMode,
    },
    /// Turns the connection into a notification stream.
    Notifications,
    GetPreferences,
    SetPreferences {
        patch: PreferencesPatch,
    },
    Log {
        client: String,
        #[serde(default = "default_log_level")]
        level: String,
        message: String,
    },
}

/// Parameters of a `create` request. Unset geometry uses the configured
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CreateSession {
    pub id: Option<SessionId>,
    /// Program to run; the user's shell when absent.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub spawn_window: bool,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A reply to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Created { id: SessionId },
    Sessions { sessions: Vec<SessionSummary> },
    Ok,
    Resized { revision: u64 },
    Killed { report: KillReport },
    CleanedUp { ids: Vec<SessionId> },
    Snapshot { snapshot: Snapshot },
    Unchanged { revision: u64 },
    Update { diff: FrameDiff },
    Preferences { preferences: NotificationPreferences },
    Attached { id: SessionId, mode: SubscriptionMode },
    Subscribed,
    Error { message: String },
}

impl ControlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            message: message.into(),
        }
    }
}

/// Text-mode subscription event, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextEvent {
    /// Initial state, including scrollback above the screen.
    Snapshot {
        revision: u64,
        cols: u16,
        rows: u16,
        history: Vec<String>,
        lines: Vec<String>,
        cursor: CursorState,
        title: Option<String>,
    },
    /// The whole visible screen after a change.
    Screen {
        revision: u64,
        cols: u16,
        rows: u16,
        lines: Vec<String>,
        cursor: CursorState,
        title: Option<String>,
    },
    Exit {
        code: i32,
        signal: Option<String>,
    },
}

impl TextEvent {
    fn screen(frame: &Frame) -> Self {
        TextEvent::Screen {
            revision: frame.revision,
            cols: frame.cols,
            rows: frame.rows,
            lines: frame.text_lines(),
            cursor: frame.cursor,
            title: frame.title.clone(),
        }
    }

    /// Render a subscription message. Row diffs have no text form; text
    /// subscriptions receive whole screens instead.
    pub fn from_message(message: SubscriptionMessage) -> Option<Self> {
        match message {
            SubscriptionMessage::Snapshot(snapshot) => Some(TextEvent::Snapshot {
                revision: snapshot.frame.revision,
                cols: snapshot.frame.cols,
                rows: snapshot.frame.rows,
                history: snapshot.history.iter().map(Line::text).collect(),
                lines: snapshot.frame.text_lines(),
                cursor: snapshot.frame.cursor,
                title: snapshot.frame.title,
            }),
            SubscriptionMessage::Screen(frame) => Some(TextEvent::screen(&frame)),
            SubscriptionMessage::Update(_) => None,
            SubscriptionMessage::Exit(exit) => Some(exit.into()),
        }
    }
}

impl From<ExitStatus> for TextEvent {
    fn from(exit: ExitStatus) -> Self {
        TextEvent::Exit {
            code: exit.code,
            signal: exit.signal,
        }
    }
}

/// One row of packed cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedLine {
    pub y: u16,
    pub wrapped: bool,
    /// `CELL_SIZE` bytes per cell.
    pub cells: Vec<u8>,
}

/// Binary-mode subscription event, bincode inside a u32 BE length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryEvent {
    Snapshot {
        revision: u64,
        cols: u16,
        rows: u16,
        /// Scrollback, oldest first. `y` counts from the top of history.
        history: Vec<PackedLine>,
        lines: Vec<PackedLine>,
        cursor: CursorState,
        title: Option<String>,
    },
    Update {
        base_revision: u64,
        revision: u64,
        cols: u16,
        rows: u16,
        lines: Vec<PackedLine>,
        cursor: CursorState,
        title: Option<String>,
    },
    Exit {
        code: i32,
        signal: Option<String>,
    },
}

impl From<SubscriptionMessage> for BinaryEvent {
    fn from(message: SubscriptionMessage) -> Self {
        match message {
            SubscriptionMessage::Snapshot(snapshot) => BinaryEvent::Snapshot {
                revision: snapshot.frame.revision,
                cols: snapshot.frame.cols,
                rows: snapshot.frame.rows,
                history: pack_lines(&snapshot.history),
                lines: pack_lines(&snapshot.frame.lines),
                cursor: snapshot.frame.cursor,
                title: snapshot.frame.title,
            },
            SubscriptionMessage::Update(diff) => BinaryEvent::Update {
                base_revision: diff.base_revision,
                revision: diff.revision,
                cols: diff.cols,
                rows: diff.rows,
                lines: diff
                    .changed
                    .iter()
                    .map(|changed| pack_line(changed.y, &changed.line))
                    .collect(),
                cursor: diff.cursor,
                title: diff.title,
            },
            SubscriptionMessage::Screen(frame) => BinaryEvent::Update {
                base_revision: frame.revision,
                revision: frame.revision,
                cols: frame.cols,
                rows: frame.rows,
                lines: pack_lines(&frame.lines),
                cursor: frame.cursor,
                title: frame.title.clone(),
            },
            SubscriptionMessage::Exit(exit) => BinaryEvent::Exit {
                code: exit.code,
                signal: exit.signal,
            },
        }
    }
}

/// Encode a single cell into 16 bytes.
///
/// Layout (little-endian where applicable):
/// - bytes 0..4:  codepoint as u32 LE
/// - bytes 4..7:  foreground RGB
/// - bytes 7..10: background RGB
/// - byte 10:     CellFlags bits
/// - byte 11:     cell width (0, 1, or 2)
/// - bytes 12..16: reserved, zero
pub fn encode_cell(cell: &Cell) -> [u8; CELL_SIZE] {
    let mut buf = [0u8; CELL_SIZE];
    buf[0..4].copy_from_slice(&(cell.codepoint as u32).to_le_bytes());
    buf[4] = cell.fg.r;
    buf[5] = cell.fg.g;
    buf[6] = cell.fg.b;
    buf[7] = cell.bg.r;
    buf[8] = cell.bg.g;
    buf[9] = cell.bg.b;
    buf[10] = cell.flags.bits();
    buf[11] = cell.width;
    buf
}

/// Encode a row of cells into binary data.
pub fn encode_line(line: &Line) -> Vec<u8> {
    let mut data = Vec::with_capacity(line.cells.len() * CELL_SIZE);
    for cell in &line.cells {
        data.extend_from_slice(&encode_cell(cell));
    }
    data
}

fn pack_line(y: u16, line: &Line) -> PackedLine {
    PackedLine {
        y,
        wrapped: line.wrapped,
        cells: encode_line(line),
    }
}

fn pack_lines(lines: &[Line]) -> Vec<PackedLine> {
    lines
        .iter()
        .enumerate()
        .map(|(y, line)| pack_line(u16::try_from(y).unwrap_or(u16::MAX), line))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Length-prefixed bincode framing for [`BinaryEvent`]s.
#[derive(Debug, Default)]
pub struct BinaryEventCodec;

impl Encoder<BinaryEvent> for BinaryEventCodec {
    type Error = CodecError;

    fn encode(&mut self, item: BinaryEvent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = bincode::serialize(&item)?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        dst.reserve(4 + data.len());
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);
        Ok(())
    }
}

impl Decoder for BinaryEventCodec {
    type Item = BinaryEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let data = src.split_to(len);
        Ok(Some(bincode::deserialize(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_vt::{CellFlags, CursorShape, Rgb};

    fn line_of(text: &str) -> Line {
        Line {
            cells: text
                .chars()
                .map(|c| Cell {
                    codepoint: c,
                    ..Cell::default()
                })
                .collect(),
            wrapped: false,
        }
    }

    #[test]
    fn test_encode_cell_default() {
        let cell = Cell::default();
        let encoded = encode_cell(&cell);

        let codepoint = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(codepoint, ' ' as u32);
        assert_eq!(&encoded[4..7], &[cell.fg.r, cell.fg.g, cell.fg.b]);
        assert_eq!(&encoded[7..10], &[0, 0, 0]);
        assert_eq!(encoded[10], 0);
        assert_eq!(encoded[11], 1);
        assert_eq!(&encoded[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_cell_with_attributes() {
        let cell = Cell {
            codepoint: 'A',
            fg: Rgb::new(255, 0, 0),
            bg: Rgb::new(0, 0, 128),
            flags: CellFlags::BOLD | CellFlags::ITALIC,
            width: 1,
        };
        let encoded = encode_cell(&cell);

        let codepoint = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(codepoint, 65);
        assert_eq!(&encoded[4..7], &[255, 0, 0]);
        assert_eq!(&encoded[7..10], &[0, 0, 128]);
        assert_eq!(encoded[10], 3);
        assert_eq!(encoded[11], 1);
    }

    #[test]
    fn test_encode_cell_wide_char() {
        let cell = Cell {
            codepoint: '\u{4e16}',
            fg: Rgb::new(200, 200, 200),
            bg: Rgb::new(30, 30, 30),
            flags: CellFlags::empty(),
            width: 2,
        };
        let encoded = encode_cell(&cell);

        let codepoint = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(codepoint, 0x4e16);
        assert_eq!(encoded[11], 2);
    }

    #[test]
    fn test_encode_cell_all_flags() {
        let cell = Cell {
            codepoint: 'X',
            fg: Rgb::new(0, 0, 0),
            bg: Rgb::new(0, 0, 0),
            flags: CellFlags::all(),
            width: 1,
        };
        assert_eq!(encode_cell(&cell)[10], 0xFF);
    }

    #[test]
    fn test_encode_line_length() {
        let line = line_of("hello");
        let data = encode_line(&line);
        assert_eq!(data.len(), 5 * CELL_SIZE);
        assert_eq!(data[CELL_SIZE], b'e');
    }

    #[test]
    fn test_parse_create_request() {
        let req: ControlRequest = serde_json::from_str(
            r#"{"type":"create","command":"/bin/sh","args":["-c","true"],"cols":100}"#,
        )
        .unwrap();
        let ControlRequest::Create(create) = req else {
            panic!("expected a create request");
        };
        assert_eq!(create.command.as_deref(), Some("/bin/sh"));
        assert_eq!(create.args, vec!["-c", "true"]);
        assert_eq!(create.cols, Some(100));
        assert_eq!(create.rows, None);
        assert!(!create.spawn_window);
    }

    #[test]
    fn test_parse_simple_requests() {
        let req: ControlRequest = serde_json::from_str(r#"{"type":"kill_all"}"#).unwrap();
        assert_eq!(req, ControlRequest::KillAll);

        let req: ControlRequest =
            serde_json::from_str(r#"{"type":"attach","id":"s1","mode":"binary"}"#).unwrap();
        assert_eq!(
            req,
            ControlRequest::Attach {
                id: "s1".into(),
                mode: SubscriptionMode::Binary
            }
        );

        let req: ControlRequest =
            serde_json::from_str(r#"{"type":"signal","id":"s1","signal":"interrupt"}"#).unwrap();
        assert!(matches!(req, ControlRequest::Signal { signal: Signal::Interrupt, .. }));
    }

    #[test]
    fn test_parse_preferences_patch_legacy_name() {
        let req: ControlRequest = serde_json::from_str(
            r#"{"type":"set_preferences","patch":{"claudeTurn":false,"bell":true}}"#,
        )
        .unwrap();
        let ControlRequest::SetPreferences { patch } = req else {
            panic!("wrong variant");
        };
        assert_eq!(patch.agent_turn, Some(false));
        assert_eq!(patch.bell, Some(true));
        assert_eq!(patch.sound, None);
    }

    #[test]
    fn test_log_request_defaults_to_info() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"type":"log","client":"web","message":"hi"}"#).unwrap();
        assert!(matches!(req, ControlRequest::Log { ref level, .. } if level == "info"));
    }

    #[test]
    fn test_error_response_shape() {
        let json = serde_json::to_string(&ControlResponse::error("failed to kill session: x")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"failed to kill session: x"}"#);
    }

    #[test]
    fn test_text_event_from_snapshot() {
        let mut frame = Frame::blank(5, 2);
        frame.lines[0] = line_of("hi   ");
        frame.revision = 4;
        let snapshot = Snapshot {
            frame,
            history: vec![line_of("old  ")],
        };
        let event = TextEvent::from_message(SubscriptionMessage::Snapshot(snapshot)).unwrap();
        match event {
            TextEvent::Snapshot { revision, history, lines, .. } => {
                assert_eq!(revision, 4);
                assert_eq!(history, vec!["old"]);
                assert_eq!(lines[0], "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_text_event_skips_row_diffs() {
        let diff = Frame::blank(2, 1).diff_to(&Frame::blank(2, 1)).unwrap();
        assert_eq!(TextEvent::from_message(SubscriptionMessage::Update(diff)), None);
    }

    #[test]
    fn test_text_exit_event_json() {
        let event = TextEvent::from(ExitStatus::code(3));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"exit","code":3,"signal":null}"#);
    }

    #[test]
    fn test_binary_update_packs_changed_rows() {
        let diff = FrameDiff {
            base_revision: 1,
            revision: 2,
            cols: 3,
            rows: 2,
            cursor: CursorState {
                row: 1,
                col: 0,
                shape: CursorShape::Bar,
                visible: true,
            },
            title: Some("t".into()),
            changed: vec![tether_vt::ChangedLine {
                y: 1,
                line: line_of("abc"),
            }],
        };
        let event = BinaryEvent::from(SubscriptionMessage::Update(diff));
        let BinaryEvent::Update { lines, base_revision, .. } = event else {
            panic!("wrong variant");
        };
        assert_eq!(base_revision, 1);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].y, 1);
        assert_eq!(lines[0].cells.len(), 3 * CELL_SIZE);
    }

    #[test]
    fn test_codec_frames_and_partial_reads() {
        let mut codec = BinaryEventCodec;
        let mut buf = BytesMut::new();
        let event = BinaryEvent::Exit {
            code: 0,
            signal: Some("SIGHUP".into()),
        };
        codec.encode(event.clone(), &mut buf).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len + 4, buf.len());

        let mut partial = buf.split_to(3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(event));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_length() {
        let mut codec = BinaryEventCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MessageTooLarge { .. })
        ));
    }
}
