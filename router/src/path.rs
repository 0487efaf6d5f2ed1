use crate::grid::SpaceQuery;
use mep_common::geom::coord::GridCoord;
use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    /// World length of planar moves.
    pub length: f64,
    pub bends: u32,
    pub layer_changes: u32,
    pub turn_penalty: f64,
    pub layer_penalty: f64,
    /// Shared-corridor and soft-violation penalties.
    pub clearance_penalty: f64,
    /// Cells entered that belong to a compatible net's corridor.
    pub shared_cells: u32,
    pub total: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ClearanceViolation {
    /// Cells entered in breach of clearance.
    pub cells: u32,
    /// Penalty charged for those cells.
    pub magnitude: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub layer: u8,
}

/// A routed cell sequence from source to sink.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Path {
    pub nodes: Vec<GridCoord>,
    pub cost: CostBreakdown,
    pub clearance_violation: Option<ClearanceViolation>,
}

impl Path {
    /// Zero-length path for coincident terminals.
    pub fn single(node: GridCoord) -> Self {
        Self {
            nodes: vec![node],
            cost: CostBreakdown::default(),
            clearance_violation: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn source(&self) -> Option<GridCoord> {
        self.nodes.first().copied()
    }

    pub fn sink(&self) -> Option<GridCoord> {
        self.nodes.last().copied()
    }

    pub fn contains(&self, c: GridCoord) -> bool {
        self.nodes.contains(&c)
    }

    /// End points, every change of direction and both ends of every layer change.
    pub fn corners(&self) -> Vec<GridCoord> {
        let n = self.nodes.len();
        if n <= 2 {
            return self.nodes.clone();
        }
        let mut out = Vec::with_capacity(8);
        out.push(self.nodes[0]);
        for i in 1..n - 1 {
            if delta(self.nodes[i - 1], self.nodes[i]) != delta(self.nodes[i], self.nodes[i + 1]) {
                out.push(self.nodes[i]);
            }
        }
        out.push(self.nodes[n - 1]);
        out
    }

    /// [`Path::corners`] mapped to cell centres in world coordinates.
    pub fn waypoints<S: SpaceQuery + ?Sized>(&self, space: &S) -> Vec<Waypoint> {
        self.corners()
            .into_iter()
            .map(|c| {
                let p = space.center(c);
                Waypoint {
                    x: p.x,
                    y: p.y,
                    layer: c.z,
                }
            })
            .collect()
    }
}

fn delta(a: GridCoord, b: GridCoord) -> (i64, i64, i16) {
    (
        b.x as i64 - a.x as i64,
        b.y as i64 - a.y as i64,
        b.z as i16 - a.z as i16,
    )
}

/// Planar direction changes along `nodes`. Layer changes do not count.
pub fn count_bends(nodes: &[GridCoord]) -> u32 {
    let mut bends = 0;
    let mut last: Option<(i64, i64)> = None;
    for pair in nodes.windows(2) {
        let (dx, dy, dz) = delta(pair[0], pair[1]);
        if dz != 0 {
            continue;
        }
        if last.is_some_and(|d| d != (dx, dy)) {
            bends += 1;
        }
        last = Some((dx, dy));
    }
    bends
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(coords: &[(u32, u32, u8)]) -> Path {
        let mut p = Path::single(GridCoord::new(coords[0].0, coords[0].1, coords[0].2));
        p.nodes = coords
            .iter()
            .map(|&(x, y, z)| GridCoord::new(x, y, z))
            .collect();
        p
    }

    #[test]
    fn corners_keep_turns_only() {
        let p = path(&[(0, 0, 0), (1, 0, 0), (2, 0, 0), (2, 1, 0), (2, 2, 0)]);
        assert_eq!(
            p.corners(),
            vec![
                GridCoord::new(0, 0, 0),
                GridCoord::new(2, 0, 0),
                GridCoord::new(2, 2, 0)
            ]
        );
        assert_eq!(count_bends(&p.nodes), 1);
    }

    #[test]
    fn layer_changes_are_corners_but_not_bends() {
        let p = path(&[(0, 0, 0), (1, 0, 0), (1, 0, 1), (2, 0, 1)]);
        assert_eq!(p.corners().len(), 4);
        assert_eq!(count_bends(&p.nodes), 0);
    }

    #[test]
    fn diagonal_runs_collapse() {
        let p = path(&[(0, 0, 0), (1, 1, 0), (2, 2, 0), (3, 2, 0)]);
        assert_eq!(p.corners().len(), 3);
        assert_eq!(count_bends(&p.nodes), 1);
    }
}
