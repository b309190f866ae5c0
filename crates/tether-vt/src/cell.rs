use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// RGB color value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Default foreground used when a cell carries no explicit color.
pub const DEFAULT_FG: Rgb = Rgb::new(229, 229, 229);

/// Default background used when a cell carries no explicit color.
pub const DEFAULT_BG: Rgb = Rgb::new(0, 0, 0);

bitflags! {
    /// Cell attribute flags, packed into a single byte.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CellFlags: u8 {
        const BOLD          = 0b0000_0001;
        const ITALIC        = 0b0000_0010;
        const UNDERLINE     = 0b0000_0100;
        const STRIKETHROUGH = 0b0000_1000;
        const INVERSE       = 0b0001_0000;
        const DIM           = 0b0010_0000;
        const HIDDEN        = 0b0100_0000;
        const BLINK         = 0b1000_0000;
    }
}

/// A single styled cell of the terminal grid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    /// The character displayed in this cell.
    pub codepoint: char,
    pub fg: Rgb,
    pub bg: Rgb,
    pub flags: CellFlags,
    /// 1 for normal, 2 for the leading half of a wide char, 0 for its spacer.
    pub width: u8,
}

impl Cell {
    /// True when the cell renders as an unstyled blank.
    pub fn is_blank(&self) -> bool {
        self.codepoint == ' ' && self.flags.is_empty() && self.bg == DEFAULT_BG
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            codepoint: ' ',
            fg: DEFAULT_FG,
            bg: DEFAULT_BG,
            flags: CellFlags::empty(),
            width: 1,
        }
    }
}
