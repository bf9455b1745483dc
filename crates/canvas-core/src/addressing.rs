use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of distinct colors a cell can hold. Colors are 4-bit values.
pub const COLOR_COUNT: u8 = 16;

/// Reference palette sent to clients; index is the stored color value.
pub const PALETTE: [&str; COLOR_COUNT as usize] = [
    "#FFFFFF", "#E4E4E4", "#888888", "#222222", "#FFA7D1", "#E50000", "#E59500", "#A06A42",
    "#E5D900", "#94E044", "#02BE01", "#00D3DD", "#0083C7", "#0000EA", "#CF6EE4", "#820080",
];

/// A validated color value in `[0, COLOR_COUNT)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(u8);

impl Color {
    pub const BACKGROUND: Color = Color(0);

    pub fn new(value: i64) -> Option<Self> {
        if (0..COLOR_COUNT as i64).contains(&value) {
            Some(Color(value as u8))
        } else {
            None
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_background(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: u32,
    pub y: u32,
}

impl CellCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Key stored in the placed-cell index.
    pub fn key(&self) -> String {
        format!("{}:{}", self.x, self.y)
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let (x, y) = key.split_once(':')?;
        Some(Self {
            x: x.parse().ok()?,
            y: y.parse().ok()?,
        })
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Fixed grid dimensions and the linear addressing derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}

impl GridSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn cell_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Checked conversion from untrusted coordinates.
    #[inline]
    pub fn coord(&self, x: i64, y: i64) -> Option<CellCoord> {
        if x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64 {
            Some(CellCoord::new(x as u32, y as u32))
        } else {
            None
        }
    }

    #[inline]
    pub fn contains(&self, coord: CellCoord) -> bool {
        coord.x < self.width && coord.y < self.height
    }

    /// `y * W + x`. Callers guarantee `coord` is inside the grid.
    #[inline]
    pub fn to_index(&self, coord: CellCoord) -> u64 {
        coord.y as u64 * self.width as u64 + coord.x as u64
    }

    #[inline]
    pub fn from_index(&self, index: u64) -> CellCoord {
        let width = self.width as u64;
        CellCoord::new((index % width) as u32, (index / width) as u32)
    }
}
