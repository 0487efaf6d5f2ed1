//! Simple polygons as delivered by the geometry extraction stage.
//!
//! Vertices are stored open (the closing edge is implicit). A trailing vertex
//! equal to the first one is dropped on construction.

use super::point::Point;
use super::rect::Rect;
use serde::{Deserialize, Serialize};

const GEOM_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolygonDefect {
    TooFewVertices,
    NonFinite,
    ZeroArea,
    /// Edges `a` and `b` (indices of their first vertex) cross each other.
    SelfIntersecting { a: usize, b: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Point<f64>>", into = "Vec<Point<f64>>")]
pub struct Polygon {
    vertices: Vec<Point<f64>>,
}

impl From<Vec<Point<f64>>> for Polygon {
    fn from(mut vertices: Vec<Point<f64>>) -> Self {
        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }
        Self { vertices }
    }
}

impl From<Polygon> for Vec<Point<f64>> {
    fn from(p: Polygon) -> Self {
        p.vertices
    }
}

impl Polygon {
    pub fn new(vertices: Vec<Point<f64>>) -> Self {
        Self::from(vertices)
    }

    /// Axis-aligned rectangle as a counter-clockwise polygon.
    pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::new(vec![
            Point::new(min_x, min_y),
            Point::new(max_x, min_y),
            Point::new(max_x, max_y),
            Point::new(min_x, max_y),
        ])
    }

    pub fn vertices(&self) -> &[Point<f64>] {
        &self.vertices
    }

    pub fn edges(&self) -> impl Iterator<Item = (Point<f64>, Point<f64>)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    pub fn signed_area(&self) -> f64 {
        let twice: f64 = self.edges().map(|(a, b)| a.cross(&b)).sum();
        twice * 0.5
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    pub fn bounds(&self) -> Rect {
        Rect::bounding(&self.vertices).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), PolygonDefect> {
        let n = self.vertices.len();
        if n < 3 {
            return Err(PolygonDefect::TooFewVertices);
        }
        if self.vertices.iter().any(|p| !p.is_finite()) {
            return Err(PolygonDefect::NonFinite);
        }
        let scale = self.bounds().width().max(self.bounds().height()).max(1.0);
        if self.area() <= GEOM_TOLERANCE * scale * scale {
            return Err(PolygonDefect::ZeroArea);
        }

        for i in 0..n {
            let (a1, a2) = (self.vertices[i], self.vertices[(i + 1) % n]);
            for j in (i + 1)..n {
                // Adjacent edges share a vertex by construction.
                if j == i + 1 || (i == 0 && j == n - 1) {
                    continue;
                }
                let (b1, b2) = (self.vertices[j], self.vertices[(j + 1) % n]);
                if segments_intersect(a1, a2, b1, b2) {
                    return Err(PolygonDefect::SelfIntersecting { a: i, b: j });
                }
            }
        }
        Ok(())
    }

    /// Even-odd containment. Points exactly on an edge may land on either side.
    pub fn contains(&self, p: Point<f64>) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// True when the polygon and the open interior of `cell` share a region
    /// of non-zero area. Polygons that only touch the cell boundary do not
    /// overlap it.
    pub fn overlaps_cell(&self, cell: &Rect) -> bool {
        if !self.bounds().overlaps(cell) {
            return false;
        }
        if self.contains(cell.center()) {
            return true;
        }
        if self.vertices.iter().any(|v| cell.contains_strict(*v)) {
            return true;
        }
        self.edges().any(|(a, b)| edge_crosses_interior(a, b, cell))
    }
}

/// Distance from `p` to the closed segment `a`-`b`.
pub fn segment_distance(p: Point<f64>, a: Point<f64>, b: Point<f64>) -> f64 {
    let ab = b - a;
    let len_sq = ab.dot(&ab);
    if len_sq <= GEOM_TOLERANCE {
        return p.distance(&a);
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    p.distance(&(a + ab * t))
}

fn orientation(p: Point<f64>, q: Point<f64>, r: Point<f64>) -> i32 {
    let val = (q.y - p.y) * (r.x - q.x) - (q.x - p.x) * (r.y - q.y);
    if val.abs() < GEOM_TOLERANCE {
        return 0;
    }
    if val > 0.0 { 1 } else { 2 }
}

fn on_segment(p: Point<f64>, a: Point<f64>, b: Point<f64>) -> bool {
    p.x >= a.x.min(b.x) - GEOM_TOLERANCE
        && p.x <= a.x.max(b.x) + GEOM_TOLERANCE
        && p.y >= a.y.min(b.y) - GEOM_TOLERANCE
        && p.y <= a.y.max(b.y) + GEOM_TOLERANCE
}

pub fn segments_intersect(a1: Point<f64>, a2: Point<f64>, b1: Point<f64>, b2: Point<f64>) -> bool {
    let o1 = orientation(a1, a2, b1);
    let o2 = orientation(a1, a2, b2);
    let o3 = orientation(b1, b2, a1);
    let o4 = orientation(b1, b2, a2);

    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == 0 && on_segment(b1, a1, a2))
        || (o2 == 0 && on_segment(b2, a1, a2))
        || (o3 == 0 && on_segment(a1, b1, b2))
        || (o4 == 0 && on_segment(a2, b1, b2))
}

// Liang-Barsky clip against the closed cell, then test the clipped midpoint
// against the open interior. A clipped piece lying on the boundary has its
// midpoint on the boundary too, so edge-touching is rejected.
fn edge_crosses_interior(a: Point<f64>, b: Point<f64>, cell: &Rect) -> bool {
    let d = b - a;
    let mut t0: f64 = 0.0;
    let mut t1: f64 = 1.0;
    let checks = [
        (-d.x, a.x - cell.min.x),
        (d.x, cell.max.x - a.x),
        (-d.y, a.y - cell.min.y),
        (d.y, cell.max.y - a.y),
    ];
    for (p, q) in checks {
        if p.abs() < GEOM_TOLERANCE {
            if q < 0.0 {
                return false;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return false;
        }
    }
    if t1 - t0 <= GEOM_TOLERANCE {
        return false;
    }
    let mid = a + d * ((t0 + t1) * 0.5);
    cell.contains_strict(mid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(x: f64, y: f64) -> Rect {
        Rect::new(Point::new(x - 0.5, y - 0.5), Point::new(x + 0.5, y + 0.5))
    }

    #[test]
    fn closing_vertex_is_dropped() {
        let p = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 0.0),
        ]);
        assert_eq!(p.vertices().len(), 3);
        assert!((p.area() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn bowtie_is_self_intersecting() {
        let p = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 2.0),
            Point::new(2.0, 0.0),
            Point::new(0.0, 2.0),
        ]);
        assert!(matches!(
            p.validate(),
            Err(PolygonDefect::SelfIntersecting { .. })
        ));
    }

    #[test]
    fn collinear_points_have_zero_area() {
        let p = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(2.0, 0.0),
        ]);
        assert_eq!(p.validate(), Err(PolygonDefect::ZeroArea));
        assert_eq!(
            Polygon::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]).validate(),
            Err(PolygonDefect::TooFewVertices)
        );
    }

    #[test]
    fn rectangle_is_valid_and_contains_center() {
        let p = Polygon::rect(0.0, 0.0, 4.0, 2.0);
        assert!(p.validate().is_ok());
        assert!(p.contains(Point::new(2.0, 1.0)));
        assert!(!p.contains(Point::new(5.0, 1.0)));
    }

    #[test]
    fn touching_cells_do_not_overlap() {
        // Wall occupying column x in [4.5, 5.5].
        let wall = Polygon::rect(4.5, -0.5, 5.5, 4.5);
        assert!(wall.overlaps_cell(&cell(5.0, 2.0)));
        assert!(!wall.overlaps_cell(&cell(4.0, 2.0)));
        assert!(!wall.overlaps_cell(&cell(6.0, 2.0)));
        // Shares only the top edge with the cell above.
        assert!(!wall.overlaps_cell(&cell(5.0, 5.0)));
    }

    #[test]
    fn thin_sliver_overlaps_conservatively() {
        // Narrow obstacle that misses every cell centre it passes through.
        let sliver = Polygon::rect(0.1, -0.5, 0.2, 2.5);
        assert!(!sliver.contains(Point::new(0.0, 1.0)));
        assert!(sliver.overlaps_cell(&cell(0.0, 1.0)));
        assert!(!sliver.overlaps_cell(&cell(1.0, 1.0)));
    }

    #[test]
    fn segment_distance_clamps_to_endpoints() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(4.0, 0.0);
        assert!((segment_distance(Point::new(2.0, 3.0), a, b) - 3.0).abs() < 1e-12);
        assert!((segment_distance(Point::new(7.0, 4.0), a, b) - 5.0).abs() < 1e-12);
        assert!((segment_distance(Point::new(1.0, 1.0), a, a) - 2f64.sqrt()).abs() < 1e-12);
    }
}
