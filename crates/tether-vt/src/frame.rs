//! Immutable screen copies and the row-level diffs exchanged between them.
//!
//! A [`Frame`] is what a subscriber holds locally. The server produces a
//! [`FrameDiff`] from the subscriber's last frame to the newest one, and
//! [`Frame::apply`] on the subscriber side reproduces the newest frame exactly.
//! Diffs always carry whole rows; cell-level diffing is not attempted.

use serde::{Deserialize, Serialize};

use crate::cell::Cell;
use crate::screen::CursorState;

/// One terminal row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub cells: Vec<Cell>,
    /// The row continues on the next one (soft wrap).
    pub wrapped: bool,
}

impl Line {
    pub fn blank(cols: u16) -> Self {
        Self {
            cells: vec![Cell::default(); cols as usize],
            wrapped: false,
        }
    }

    /// Plain text of the row with trailing blanks removed.
    pub fn text(&self) -> String {
        let text: String = self
            .cells
            .iter()
            .filter(|cell| cell.width != 0)
            .map(|cell| cell.codepoint)
            .collect();
        text.trim_end().to_string()
    }
}

/// The visible screen at one buffer revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub revision: u64,
    pub cols: u16,
    pub rows: u16,
    pub lines: Vec<Line>,
    pub cursor: CursorState,
    pub title: Option<String>,
}

impl Frame {
    /// An empty frame of the given geometry at revision 0.
    pub fn blank(cols: u16, rows: u16) -> Self {
        Self {
            revision: 0,
            cols,
            rows,
            lines: (0..rows).map(|_| Line::blank(cols)).collect(),
            cursor: CursorState::default(),
            title: None,
        }
    }

    /// Visible text, one entry per row.
    pub fn text_lines(&self) -> Vec<String> {
        self.lines.iter().map(Line::text).collect()
    }

    /// True when any visible row contains `needle`.
    pub fn contains_text(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.text().contains(needle))
    }

    /// Compare content, ignoring the revision number.
    pub fn same_content(&self, other: &Frame) -> bool {
        self.cols == other.cols
            && self.rows == other.rows
            && self.lines == other.lines
            && self.cursor == other.cursor
            && self.title == other.title
    }

    /// Row-level diff from `self` to `newer`.
    ///
    /// Returns `None` when the geometry differs; the receiver then needs a
    /// fresh snapshot instead.
    pub fn diff_to(&self, newer: &Frame) -> Option<FrameDiff> {
        if self.cols != newer.cols || self.rows != newer.rows {
            return None;
        }
        let changed = self
            .lines
            .iter()
            .zip(newer.lines.iter())
            .enumerate()
            .filter(|(_, (old, new))| old != new)
            .map(|(y, (_, new))| ChangedLine {
                y: y as u16,
                line: new.clone(),
            })
            .collect();

        Some(FrameDiff {
            base_revision: self.revision,
            revision: newer.revision,
            cols: newer.cols,
            rows: newer.rows,
            cursor: newer.cursor,
            title: newer.title.clone(),
            changed,
        })
    }

    /// Apply a diff produced against this frame.
    pub fn apply(&mut self, diff: &FrameDiff) -> Result<(), DiffMismatch> {
        if diff.base_revision != self.revision {
            return Err(DiffMismatch::Revision {
                expected: diff.base_revision,
                actual: self.revision,
            });
        }
        if diff.cols != self.cols || diff.rows != self.rows {
            return Err(DiffMismatch::Geometry);
        }
        for changed in &diff.changed {
            let slot = self
                .lines
                .get_mut(changed.y as usize)
                .ok_or(DiffMismatch::Geometry)?;
            *slot = changed.line.clone();
        }
        self.revision = diff.revision;
        self.cursor = diff.cursor;
        self.title = diff.title.clone();
        Ok(())
    }
}

/// A replaced row inside a [`FrameDiff`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedLine {
    pub y: u16,
    pub line: Line,
}

/// Full-row changes between two frames of equal geometry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDiff {
    pub base_revision: u64,
    pub revision: u64,
    pub cols: u16,
    pub rows: u16,
    pub cursor: CursorState,
    pub title: Option<String>,
    pub changed: Vec<ChangedLine>,
}

impl FrameDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.base_revision == self.revision
    }
}

/// Why a diff could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffMismatch {
    #[error("diff expects base revision {expected}, local frame is at {actual}")]
    Revision { expected: u64, actual: u64 },
    #[error("diff geometry does not match the local frame")]
    Geometry,
}

/// A frame plus retained scrollback, used to bootstrap a subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub frame: Frame,
    /// Scrollback rows, oldest first.
    pub history: Vec<Line>,
}

impl Snapshot {
    pub fn revision(&self) -> u64 {
        self.frame.revision
    }
}
