pub mod dense;
pub mod raster;

pub use dense::{Cell, CellClass, CommitSummary, Occupancy, SpaceModel};

use mep_common::db::core::{Discipline, DisciplineSet};
use mep_common::geom::coord::GridCoord;
use mep_common::geom::point::Point;

/// Read-only view of the occupancy grid used by the routing graph.
pub trait SpaceQuery: Sync + Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn layers(&self) -> u8;
    fn resolution(&self) -> f64;

    fn in_bounds(&self, c: GridCoord) -> bool {
        c.x < self.width() && c.y < self.height() && c.z < self.layers()
    }

    /// Dense index `z * w * h + y * w + x`. Caller guarantees bounds.
    #[inline(always)]
    fn index(&self, c: GridCoord) -> usize {
        let w = self.width() as usize;
        let h = self.height() as usize;
        (c.z as usize) * w * h + (c.y as usize) * w + (c.x as usize)
    }

    #[inline(always)]
    fn coord(&self, idx: usize) -> GridCoord {
        let w = self.width() as usize;
        let plane = w * self.height() as usize;
        let z = idx / plane;
        let rem = idx % plane;
        GridCoord::new((rem % w) as u32, (rem / w) as u32, z as u8)
    }

    fn num_cells(&self) -> usize {
        self.width() as usize * self.height() as usize * self.layers() as usize
    }

    /// Out-of-bounds cells read as [`Occupancy::Obstacle`].
    fn occupancy(&self, c: GridCoord) -> Occupancy;
    fn permitted(&self, c: GridCoord) -> DisciplineSet;
    /// World distance from the cell centre to the nearest obstacle cell
    /// centre on the same layer; infinite on layers without obstacles.
    fn obstacle_distance(&self, c: GridCoord) -> f64;
    fn is_transfer(&self, c: GridCoord) -> bool;
    /// Zone clearance for `d` at this cell, when a zone overrides it.
    fn clearance_override(&self, c: GridCoord, d: Discipline) -> Option<f64>;
    /// Epoch of the last reservation change touching the cell.
    fn cell_epoch(&self, c: GridCoord) -> u32;
    fn center(&self, c: GridCoord) -> Point<f64>;

    fn is_obstacle(&self, c: GridCoord) -> bool {
        matches!(self.occupancy(c), Occupancy::Obstacle)
    }
}
