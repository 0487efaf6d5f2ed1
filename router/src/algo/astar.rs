use crate::graph::{NetContext, Neighbor, RoutingGraph, Step};
use crate::grid::SpaceQuery;
use mep_common::geom::coord::GridCoord;
use priority_queue::PriorityQueue;
use std::cmp::Ordering;

/// Direction slots per cell: the eight planar directions plus "none yet".
const DIR_SLOTS: u32 = 9;
const NO_DIR: u32 = 8;

/// Open-set priority. Greater pops first: lower f, then fewer bends, then
/// lower g, then lower state index.
#[derive(Clone, Copy, Debug, PartialEq)]
struct SearchKey {
    f: f64,
    bends: u32,
    g: f64,
    state: u32,
}

impl Eq for SearchKey {}

impl Ord for SearchKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.bends.cmp(&self.bends))
            .then_with(|| other.g.total_cmp(&self.g))
            .then_with(|| other.state.cmp(&self.state))
    }
}

impl PartialOrd for SearchKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub expansions: u64,
    pub max_open: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SearchOutcome {
    Found {
        nodes: Vec<GridCoord>,
        cost: f64,
        bends: u32,
    },
    Exhausted,
}

/// Reusable A* over `(cell, incoming direction)` states. One instance per
/// worker; buffers grow to the largest grid seen and are reset by tag.
#[derive(Clone)]
pub struct AStar {
    parents: Vec<u32>,
    g_score: Vec<f64>,
    bends: Vec<u32>,
    visited_tag: Vec<u32>,
    closed_tag: Vec<u32>,
    current_tag: u32,
    capacity: usize,
    scratch: Vec<Neighbor>,
}

impl Default for AStar {
    fn default() -> Self {
        Self::new()
    }
}

impl AStar {
    pub fn new() -> Self {
        let cap = 100_000;
        Self {
            parents: vec![u32::MAX; cap],
            g_score: vec![f64::INFINITY; cap],
            bends: vec![0; cap],
            visited_tag: vec![0; cap],
            closed_tag: vec![0; cap],
            current_tag: 1,
            capacity: cap,
            scratch: Vec::with_capacity(10),
        }
    }

    fn ensure_capacity(&mut self, size: usize) {
        if size > self.capacity {
            self.capacity = size.max(self.capacity * 2);
            self.parents.resize(self.capacity, u32::MAX);
            self.g_score.resize(self.capacity, f64::INFINITY);
            self.bends.resize(self.capacity, 0);
            self.visited_tag.resize(self.capacity, 0);
            self.closed_tag.resize(self.capacity, 0);
        }
    }

    fn reset(&mut self) {
        self.current_tag = self.current_tag.wrapping_add(1);
        if self.current_tag == 0 {
            self.visited_tag.fill(0);
            self.closed_tag.fill(0);
            self.current_tag = 1;
        }
    }

    /// Cheapest path from `ctx.source` to `ctx.sink`. Ties on cost go to
    /// fewer bends, then to the lower state index, so equal inputs always
    /// give the same path.
    pub fn find_path<S: SpaceQuery + ?Sized>(
        &mut self,
        graph: &RoutingGraph<S>,
        ctx: &NetContext,
    ) -> (SearchOutcome, SearchStats) {
        let space = graph.space();
        let mut stats = SearchStats::default();
        let states = space.num_cells() * DIR_SLOTS as usize;
        if states > u32::MAX as usize {
            log::error!("Grid too large for search state indexing ({} states)", states);
            return (SearchOutcome::Exhausted, stats);
        }
        self.ensure_capacity(states);
        self.reset();

        let mut open: PriorityQueue<u32, SearchKey> = PriorityQueue::new();
        let start = space.index(ctx.source) as u32 * DIR_SLOTS + NO_DIR;
        self.g_score[start as usize] = 0.0;
        self.bends[start as usize] = 0;
        self.parents[start as usize] = u32::MAX;
        self.visited_tag[start as usize] = self.current_tag;
        open.push(
            start,
            SearchKey {
                f: graph.heuristic(ctx.source, ctx.sink),
                bends: 0,
                g: 0.0,
                state: start,
            },
        );

        let mut scratch = std::mem::take(&mut self.scratch);
        let mut outcome = SearchOutcome::Exhausted;

        while let Some((state, key)) = open.pop() {
            let s = state as usize;
            self.closed_tag[s] = self.current_tag;
            let cell = state / DIR_SLOTS;
            let dir = state % DIR_SLOTS;
            let position = space.coord(cell as usize);
            if position == ctx.sink {
                outcome = SearchOutcome::Found {
                    nodes: self.reconstruct(state, space),
                    cost: key.g,
                    bends: key.bends,
                };
                break;
            }
            stats.expansions += 1;

            let incoming = (dir != NO_DIR).then_some(dir as u8);
            graph.neighbors_into(position, &mut scratch);
            for nb in &scratch {
                let Some(edge) = graph.edge_cost_detail(nb, incoming, ctx) else {
                    continue;
                };
                let next_dir = match nb.step {
                    Step::Planar(d) => d as u32,
                    Step::Up | Step::Down => dir,
                };
                let next = space.index(nb.to) as u32 * DIR_SLOTS + next_dir;
                let n = next as usize;
                if self.closed_tag[n] == self.current_tag {
                    continue;
                }
                let g = key.g + edge.total();
                let bends = key.bends + edge.bend as u32;
                let seen = self.visited_tag[n] == self.current_tag;
                let better = !seen
                    || g < self.g_score[n]
                    || (g == self.g_score[n] && bends < self.bends[n]);
                if !better {
                    continue;
                }
                self.parents[n] = state;
                self.g_score[n] = g;
                self.bends[n] = bends;
                self.visited_tag[n] = self.current_tag;
                open.push(
                    next,
                    SearchKey {
                        f: g + graph.heuristic(nb.to, ctx.sink),
                        bends,
                        g,
                        state: next,
                    },
                );
            }
            stats.max_open = stats.max_open.max(open.len());
        }

        self.scratch = scratch;
        (outcome, stats)
    }

    fn reconstruct<S: SpaceQuery + ?Sized>(&self, end: u32, space: &S) -> Vec<GridCoord> {
        let mut path = Vec::new();
        let mut state = end;
        loop {
            path.push(space.coord((state / DIR_SLOTS) as usize));
            let parent = self.parents[state as usize];
            if parent == u32::MAX {
                break;
            }
            state = parent;
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Connectivity, GraphParams};
    use crate::grid::SpaceModel;
    use crate::grid::dense::BuildOptions;
    use mep_common::db::core::{ClearanceMode, Discipline, Obstacle};
    use mep_common::db::indices::NetId;
    use mep_common::geom::point::Point;
    use mep_common::geom::polygon::Polygon;
    use mep_common::geom::rect::Rect;
    use mep_common::util::config::DisciplineTable;

    fn open_floor(obstacles: &[Obstacle]) -> SpaceModel {
        let opts = BuildOptions {
            extent: Some(Rect::new(Point::new(-0.5, -0.5), Point::new(9.5, 9.5))),
            ..BuildOptions::new(1.0)
        };
        SpaceModel::build_with(obstacles, &[], &[], &[], &opts).unwrap()
    }

    fn ctx(source: GridCoord, sink: GridCoord) -> NetContext {
        NetContext::new(NetId::new(0), Discipline::Duct, 1.0, ClearanceMode::Hard, source, sink)
    }

    #[test]
    fn straight_run_has_no_bends() {
        let m = open_floor(&[]);
        let table = DisciplineTable::default();
        let params = GraphParams::default();
        let g = RoutingGraph::new(&m, &params, &table);
        let (outcome, stats) =
            AStar::new().find_path(&g, &ctx(GridCoord::new(1, 4, 0), GridCoord::new(8, 4, 0)));
        match outcome {
            SearchOutcome::Found { nodes, cost, bends } => {
                assert_eq!(nodes.len(), 8);
                assert_eq!(cost, 7.0);
                assert_eq!(bends, 0);
            }
            SearchOutcome::Exhausted => panic!("no path"),
        }
        assert!(stats.expansions >= 7);
    }

    #[test]
    fn four_connected_corner_run_takes_one_bend() {
        let m = open_floor(&[]);
        let table = DisciplineTable::default();
        let params = GraphParams {
            connectivity: Connectivity::Four,
            turn_penalty: 2.0,
            ..GraphParams::default()
        };
        let g = RoutingGraph::new(&m, &params, &table);
        let (outcome, _) =
            AStar::new().find_path(&g, &ctx(GridCoord::new(0, 0, 0), GridCoord::new(9, 9, 0)));
        let SearchOutcome::Found { nodes, cost, bends } = outcome else {
            panic!("no path");
        };
        assert_eq!(nodes.len(), 19);
        assert_eq!(bends, 1);
        assert_eq!(cost, 20.0);
    }

    #[test]
    fn walled_in_sink_exhausts() {
        let ring: Vec<Obstacle> = [(6, 7), (7, 7), (8, 7), (6, 8), (8, 8), (6, 9), (8, 9), (7, 9)]
            .iter()
            .map(|&(x, y)| {
                let (x, y) = (x as f64, y as f64);
                Obstacle::new(Polygon::rect(x - 0.5, y - 0.5, x + 0.5, y + 0.5))
            })
            .collect();
        let m = open_floor(&ring);
        let table = DisciplineTable::default();
        let params = GraphParams::default();
        let g = RoutingGraph::new(&m, &params, &table);
        let mut astar = AStar::new();
        let (outcome, _) = astar.find_path(&g, &ctx(GridCoord::new(0, 0, 0), GridCoord::new(7, 8, 0)));
        assert_eq!(outcome, SearchOutcome::Exhausted);

        // Buffers are reusable after an exhausted search.
        let (again, _) = astar.find_path(&g, &ctx(GridCoord::new(0, 0, 0), GridCoord::new(3, 3, 0)));
        assert!(matches!(again, SearchOutcome::Found { .. }));
    }

    #[test]
    fn equal_cost_ties_prefer_fewer_bends() {
        let m = open_floor(&[]);
        let table = DisciplineTable::default();
        let params = GraphParams {
            connectivity: Connectivity::Four,
            turn_penalty: 0.0,
            ..GraphParams::default()
        };
        let g = RoutingGraph::new(&m, &params, &table);
        let (outcome, _) =
            AStar::new().find_path(&g, &ctx(GridCoord::new(2, 2, 0), GridCoord::new(6, 5, 0)));
        let SearchOutcome::Found { cost, bends, .. } = outcome else {
            panic!("no path");
        };
        assert_eq!(cost, 7.0);
        assert_eq!(bends, 1);
    }
}
