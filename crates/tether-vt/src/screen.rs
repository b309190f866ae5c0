use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line as GridLine};
use alacritty_terminal::term::cell::Flags as AlacFlags;
use alacritty_terminal::term::color::Colors;
use alacritty_terminal::term::Term;
use alacritty_terminal::vte::ansi::{Color, CursorShape as AlacCursorShape, NamedColor, Rgb as AlacRgb};
use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellFlags, Rgb, DEFAULT_BG, DEFAULT_FG};
use crate::frame::Line;
use crate::terminal::EventProxy;

/// Current state of the cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub row: u16,
    pub col: u16,
    pub shape: CursorShape,
    pub visible: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            shape: CursorShape::Block,
            visible: true,
        }
    }
}

/// Shape of the terminal cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorShape {
    Block,
    Underline,
    Bar,
    Hidden,
}

impl CursorShape {
    pub fn as_str(self) -> &'static str {
        match self {
            CursorShape::Block => "block",
            CursorShape::Underline => "underline",
            CursorShape::Bar => "bar",
            CursorShape::Hidden => "hidden",
        }
    }
}

/// A read-only view into the terminal grid.
pub struct ScreenView<'a> {
    term: &'a Term<EventProxy>,
}

impl<'a> ScreenView<'a> {
    pub(crate) fn new(term: &'a Term<EventProxy>) -> Self {
        Self { term }
    }

    /// Number of visible rows.
    pub fn rows(&self) -> u16 {
        self.term.screen_lines() as u16
    }

    /// Number of columns.
    pub fn cols(&self) -> u16 {
        self.term.columns() as u16
    }

    /// Number of scrollback lines currently retained above the screen.
    pub fn history_len(&self) -> usize {
        self.term.grid().history_size()
    }

    /// Get a single cell at the given row and column.
    ///
    /// Row 0 is the top of the visible screen.
    pub fn cell(&self, row: u16, col: u16) -> Cell {
        if (row as usize) >= self.term.screen_lines() || (col as usize) >= self.term.columns() {
            return Cell::default();
        }
        let cell = &self.term.grid()[GridLine(row as i32)][Column(col as usize)];
        convert_cell(cell, self.term.colors())
    }

    /// A visible row with its wrap marker.
    pub fn line(&self, row: u16) -> Line {
        if (row as usize) >= self.term.screen_lines() {
            return Line::blank(self.cols());
        }
        self.grid_line(GridLine(row as i32))
    }

    /// A scrollback row, `index` 0 being the oldest retained line.
    pub fn history_line(&self, index: usize) -> Option<Line> {
        let history = self.history_len();
        if index >= history {
            return None;
        }
        let offset = index as i32 - history as i32;
        Some(self.grid_line(GridLine(offset)))
    }

    fn grid_line(&self, line: GridLine) -> Line {
        let grid = self.term.grid();
        let cols = self.term.columns();
        let row = &grid[line];
        let cells = (0..cols)
            .map(|col| convert_cell(&row[Column(col)], self.term.colors()))
            .collect();
        let wrapped = cols > 0 && row[Column(cols - 1)].flags.contains(AlacFlags::WRAPLINE);
        Line { cells, wrapped }
    }
}

/// Standard xterm-256color ANSI palette.
const ANSI_COLORS: [AlacRgb; 16] = [
    AlacRgb { r: 0, g: 0, b: 0 },       // Black
    AlacRgb { r: 205, g: 0, b: 0 },     // Red
    AlacRgb { r: 0, g: 205, b: 0 },     // Green
    AlacRgb { r: 205, g: 205, b: 0 },   // Yellow
    AlacRgb { r: 0, g: 0, b: 238 },     // Blue
    AlacRgb { r: 205, g: 0, b: 205 },   // Magenta
    AlacRgb { r: 0, g: 205, b: 205 },   // Cyan
    AlacRgb { r: 229, g: 229, b: 229 }, // White
    AlacRgb { r: 127, g: 127, b: 127 }, // Bright Black
    AlacRgb { r: 255, g: 0, b: 0 },     // Bright Red
    AlacRgb { r: 0, g: 255, b: 0 },     // Bright Green
    AlacRgb { r: 255, g: 255, b: 0 },   // Bright Yellow
    AlacRgb { r: 92, g: 92, b: 255 },   // Bright Blue
    AlacRgb { r: 255, g: 0, b: 255 },   // Bright Magenta
    AlacRgb { r: 0, g: 255, b: 255 },   // Bright Cyan
    AlacRgb { r: 255, g: 255, b: 255 }, // Bright White
];

/// Resolve a `vte::ansi::Color` to an `Rgb` using the terminal's palette.
pub(crate) fn resolve_color(color: &Color, colors: &Colors, is_fg: bool) -> Rgb {
    match color {
        Color::Spec(rgb) => Rgb::new(rgb.r, rgb.g, rgb.b),
        Color::Named(named) => {
            if let Some(rgb) = colors[*named] {
                return Rgb::new(rgb.r, rgb.g, rgb.b);
            }
            let idx = *named as usize;
            match named {
                NamedColor::Foreground | NamedColor::BrightForeground | NamedColor::Cursor => {
                    DEFAULT_FG
                }
                NamedColor::Background => DEFAULT_BG,
                _ if idx < 16 => {
                    let c = ANSI_COLORS[idx];
                    Rgb::new(c.r, c.g, c.b)
                }
                NamedColor::DimBlack => Rgb::new(0, 0, 0),
                NamedColor::DimRed => Rgb::new(154, 0, 0),
                NamedColor::DimGreen => Rgb::new(0, 154, 0),
                NamedColor::DimYellow => Rgb::new(154, 154, 0),
                NamedColor::DimBlue => Rgb::new(0, 0, 178),
                NamedColor::DimMagenta => Rgb::new(154, 0, 154),
                NamedColor::DimCyan => Rgb::new(0, 154, 154),
                NamedColor::DimWhite | NamedColor::DimForeground => Rgb::new(178, 178, 178),
                _ if is_fg => DEFAULT_FG,
                _ => DEFAULT_BG,
            }
        }
        Color::Indexed(idx) => {
            let idx = *idx as usize;
            if let Some(rgb) = colors[idx] {
                Rgb::new(rgb.r, rgb.g, rgb.b)
            } else if idx < 16 {
                let c = ANSI_COLORS[idx];
                Rgb::new(c.r, c.g, c.b)
            } else if idx < 232 {
                // 216-color cube.
                let n = idx - 16;
                let to_byte = |v: usize| if v == 0 { 0u8 } else { (55 + 40 * v) as u8 };
                Rgb::new(to_byte((n / 36) % 6), to_byte((n / 6) % 6), to_byte(n % 6))
            } else {
                // Grayscale ramp.
                let v = (8 + 10 * (idx - 232)) as u8;
                Rgb::new(v, v, v)
            }
        }
    }
}

pub(crate) fn convert_cell(cell: &alacritty_terminal::term::cell::Cell, colors: &Colors) -> Cell {
    const FLAG_MAP: [(AlacFlags, CellFlags); 7] = [
        (AlacFlags::BOLD, CellFlags::BOLD),
        (AlacFlags::ITALIC, CellFlags::ITALIC),
        (AlacFlags::UNDERLINE, CellFlags::UNDERLINE),
        (AlacFlags::STRIKEOUT, CellFlags::STRIKETHROUGH),
        (AlacFlags::INVERSE, CellFlags::INVERSE),
        (AlacFlags::DIM, CellFlags::DIM),
        (AlacFlags::HIDDEN, CellFlags::HIDDEN),
    ];

    let flags = FLAG_MAP
        .iter()
        .filter(|(alac, _)| cell.flags.contains(*alac))
        .fold(CellFlags::empty(), |acc, (_, ours)| acc | *ours);

    let width = if cell.flags.contains(AlacFlags::WIDE_CHAR) {
        2
    } else if cell.flags.contains(AlacFlags::WIDE_CHAR_SPACER) {
        0
    } else {
        1
    };

    Cell {
        codepoint: cell.c,
        fg: resolve_color(&cell.fg, colors, true),
        bg: resolve_color(&cell.bg, colors, false),
        flags,
        width,
    }
}

pub(crate) fn convert_cursor_shape(shape: AlacCursorShape) -> CursorShape {
    match shape {
        AlacCursorShape::Block | AlacCursorShape::HollowBlock => CursorShape::Block,
        AlacCursorShape::Underline => CursorShape::Underline,
        AlacCursorShape::Beam => CursorShape::Bar,
        AlacCursorShape::Hidden => CursorShape::Hidden,
    }
}
