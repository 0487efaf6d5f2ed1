use mep_common::geom::coord::GridCoord;
use mep_common::geom::point::Point;
use mep_common::geom::rect::Rect;

/// Maps world coordinates onto square cells of side `resolution` anchored
/// at `origin` (the lower-left corner of cell (0, 0)).
#[derive(Clone, Debug, PartialEq)]
pub struct GridConverter {
    origin: Point<f64>,
    resolution: f64,
    grid_w: u32,
    grid_h: u32,
}

impl GridConverter {
    pub fn new(origin: Point<f64>, resolution: f64, grid_w: u32, grid_h: u32) -> Self {
        Self {
            origin,
            resolution,
            grid_w,
            grid_h,
        }
    }

    /// Covers `extent` with whole cells; the last row and column may overhang.
    pub fn for_extent(extent: &Rect, resolution: f64) -> Self {
        let w = (extent.width() / resolution).ceil().max(1.0) as u32;
        let h = (extent.height() / resolution).ceil().max(1.0) as u32;
        Self::new(extent.min, resolution, w, h)
    }

    pub fn width(&self) -> u32 {
        self.grid_w
    }

    pub fn height(&self) -> u32 {
        self.grid_h
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Cell containing `p`, or `None` outside the grid. Points on the far
    /// boundary belong to the last row or column.
    pub fn to_grid(&self, p: Point<f64>, layer: u8) -> Option<GridCoord> {
        let raw_x = (p.x - self.origin.x) / self.resolution;
        let raw_y = (p.y - self.origin.y) / self.resolution;
        let eps = 1e-9;
        if raw_x < -eps || raw_y < -eps {
            return None;
        }
        let x = self.axis_index(raw_x, self.grid_w)?;
        let y = self.axis_index(raw_y, self.grid_h)?;
        Some(GridCoord::new(x, y, layer))
    }

    fn axis_index(&self, raw: f64, cells: u32) -> Option<u32> {
        let i = raw.max(0.0).floor() as u64;
        if i < cells as u64 {
            Some(i as u32)
        } else if i == cells as u64 && (raw - cells as f64).abs() < 1e-9 {
            Some(cells - 1)
        } else {
            None
        }
    }

    /// Nearest cell, clamped into the grid.
    pub fn to_grid_clamped(&self, p: Point<f64>, layer: u8) -> GridCoord {
        let raw_x = ((p.x - self.origin.x) / self.resolution).floor();
        let raw_y = ((p.y - self.origin.y) / self.resolution).floor();
        let x = raw_x.max(0.0).min((self.grid_w - 1) as f64) as u32;
        let y = raw_y.max(0.0).min((self.grid_h - 1) as f64) as u32;
        GridCoord::new(x, y, layer)
    }

    /// Centre of the cell in world coordinates.
    pub fn to_world(&self, g: GridCoord) -> Point<f64> {
        Point::new(
            self.origin.x + (g.x as f64 + 0.5) * self.resolution,
            self.origin.y + (g.y as f64 + 0.5) * self.resolution,
        )
    }

    pub fn cell_rect(&self, x: u32, y: u32) -> Rect {
        let min = Point::new(
            self.origin.x + x as f64 * self.resolution,
            self.origin.y + y as f64 * self.resolution,
        );
        Rect::new(
            min,
            Point::new(min.x + self.resolution, min.y + self.resolution),
        )
    }

    /// World rectangle spanned by row `y`.
    pub fn row_rect(&self, y: u32) -> Rect {
        let min_y = self.origin.y + y as f64 * self.resolution;
        Rect::new(
            Point::new(self.origin.x, min_y),
            Point::new(
                self.origin.x + self.grid_w as f64 * self.resolution,
                min_y + self.resolution,
            ),
        )
    }

    /// Inclusive cell ranges whose cells may intersect `rect`, clamped to the grid.
    pub fn cell_span(&self, rect: &Rect) -> Option<((u32, u32), (u32, u32))> {
        let x0 = ((rect.min.x - self.origin.x) / self.resolution).floor();
        let x1 = ((rect.max.x - self.origin.x) / self.resolution).floor();
        let y0 = ((rect.min.y - self.origin.y) / self.resolution).floor();
        let y1 = ((rect.max.y - self.origin.y) / self.resolution).floor();
        if x1 < 0.0 || y1 < 0.0 || x0 >= self.grid_w as f64 || y0 >= self.grid_h as f64 {
            return None;
        }
        let clamp_x = |v: f64| v.max(0.0).min((self.grid_w - 1) as f64) as u32;
        let clamp_y = |v: f64| v.max(0.0).min((self.grid_h - 1) as f64) as u32;
        Some(((clamp_x(x0), clamp_x(x1)), (clamp_y(y0), clamp_y(y1))))
    }
}
