//! # Display Positions
//!
//! Source references packed into 64 bits: display id, byte index, line, and
//! column. Positions are created by the lexer and flow through every later
//! phase for diagnostics. Rendering (caret drawing, color schemes) lives in
//! an external collaborator; this module only carries the coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bit widths for the packed representation.
///
/// 10 bits of display id, 28 bits of byte index, 14 bits of line, 12 bits of
/// column. A position with any field out of range is stored as invalid.
const DISPLAY_BITS: u64 = 10;
const INDEX_BITS: u64 = 28;
const LINE_BITS: u64 = 14;
const COLUMN_BITS: u64 = 12;

const INDEX_SHIFT: u64 = LINE_BITS + COLUMN_BITS;
const DISPLAY_SHIFT: u64 = INDEX_SHIFT + INDEX_BITS;

pub const MAX_DISPLAY_ID: u64 = (1 << DISPLAY_BITS) - 1;
pub const MAX_BYTE_INDEX: u64 = (1 << INDEX_BITS) - 1;
pub const MAX_LINE: u64 = (1 << LINE_BITS) - 1;
pub const MAX_COLUMN: u64 = (1 << COLUMN_BITS) - 1;

/// Identifier of one opened display (an input file or buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisplayId(pub u32);

/// A packed source position. `Copy`, immutable, and totally ordered within a
/// single display (display id occupies the most significant bits, so ordering
/// across displays groups by display first).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisplayPosition(u64);

impl DisplayPosition {
    /// The invalid sentinel. All-ones so it sorts after every real position.
    pub const INVALID: DisplayPosition = DisplayPosition(u64::MAX);

    /// Pack a position. Returns the invalid sentinel when any coordinate does
    /// not fit its field.
    pub fn new(display: DisplayId, index: u64, line: u64, column: u64) -> Self {
        let display = u64::from(display.0);
        if display > MAX_DISPLAY_ID || index > MAX_BYTE_INDEX || line > MAX_LINE
            || column > MAX_COLUMN
        {
            return Self::INVALID;
        }
        DisplayPosition(
            (display << DISPLAY_SHIFT) | (index << INDEX_SHIFT) | (line << COLUMN_BITS) | column,
        )
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn display(self) -> Option<DisplayId> {
        if self.is_valid() {
            Some(DisplayId((self.0 >> DISPLAY_SHIFT) as u32))
        } else {
            None
        }
    }

    /// Byte offset from the start of the display.
    pub fn index(self) -> u64 {
        (self.0 >> INDEX_SHIFT) & MAX_BYTE_INDEX
    }

    /// 1-based line number.
    pub fn line(self) -> u64 {
        (self.0 >> COLUMN_BITS) & MAX_LINE
    }

    /// 1-based column number.
    pub fn column(self) -> u64 {
        self.0 & MAX_COLUMN
    }

    /// Whether `self` and `other` point into the same display.
    pub fn same_display(self, other: DisplayPosition) -> bool {
        self.is_valid() && other.is_valid() && self.display() == other.display()
    }
}

impl fmt::Debug for DisplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}:{}", self.display().map_or(0, |d| d.0), self.line(), self.column())
        } else {
            write!(f, "<invalid>")
        }
    }
}

impl fmt::Display for DisplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}", self.line(), self.column())
        } else {
            write!(f, "?:?")
        }
    }
}

/// A half-open range of positions within one display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayRange {
    pub from: DisplayPosition,
    pub to: DisplayPosition,
}

impl DisplayRange {
    pub const INVALID: DisplayRange = DisplayRange {
        from: DisplayPosition::INVALID,
        to: DisplayPosition::INVALID,
    };

    pub fn new(from: DisplayPosition, to: DisplayPosition) -> Self {
        DisplayRange { from, to }
    }

    pub fn is_valid(&self) -> bool {
        self.from.is_valid() && self.to.is_valid() && self.from.same_display(self.to)
            && self.from.index() <= self.to.index()
    }

    /// Extend this range to also cover `other`. Ranges from different
    /// displays do not merge.
    pub fn union(&self, other: DisplayRange) -> DisplayRange {
        if !self.is_valid() {
            return other;
        }
        if !other.is_valid() || !self.from.same_display(other.from) {
            return *self;
        }
        DisplayRange {
            from: if other.from.index() < self.from.index() { other.from } else { self.from },
            to: if other.to.index() > self.to.index() { other.to } else { self.to },
        }
    }

    pub fn len(&self) -> u64 {
        if self.is_valid() {
            self.to.index() - self.from.index()
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for DisplayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.from)
    }
}

/// Configuration of one display: how wide a tab renders and whether tab stops
/// are aligned (editor style) or fixed-width.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub tab_width: u64,
    pub use_tab_stops: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig { tab_width: 4, use_tab_stops: true }
    }
}

impl DisplayConfig {
    /// Column reached after a tab at `column` (1-based).
    pub fn next_tab_column(&self, column: u64) -> u64 {
        if self.use_tab_stops {
            ((column - 1) / self.tab_width + 1) * self.tab_width + 1
        } else {
            column + self.tab_width
        }
    }
}
