use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Cell address in the layered routing grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl GridCoord {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Planar neighbour, `None` when the offset leaves the non-negative quadrant.
    #[inline]
    pub fn offset(&self, dx: i32, dy: i32) -> Option<Self> {
        let x = self.x.checked_add_signed(dx)?;
        let y = self.y.checked_add_signed(dy)?;
        Some(Self::new(x, y, self.z))
    }

    #[inline]
    pub fn same_column(&self, other: &GridCoord) -> bool {
        self.x == other.x && self.y == other.y
    }
}

// Layer-major, then row, then column.
impl Ord for GridCoord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.z
            .cmp(&other.z)
            .then_with(|| self.y.cmp(&other.y))
            .then_with(|| self.x.cmp(&other.x))
    }
}

impl PartialOrd for GridCoord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
