//! Implicit routing graph over the occupancy grid.
//!
//! Nodes are cells. Edges join planar neighbours (4 or 8 of them) and the
//! same column on adjacent layers where both cells are transfer points.
//! Costs depend on the net being routed, so they are computed per query from
//! a [`NetContext`] rather than stored.

use crate::grid::{Occupancy, SpaceQuery};
use crate::path::{ClearanceViolation, CostBreakdown, Path};
use mep_common::db::core::{ClearanceMode, Discipline};
use mep_common::db::indices::NetId;
use mep_common::error::ConfigError;
use mep_common::geom::coord::GridCoord;
use mep_common::util::config::{DisciplineTable, GraphConfig, ReservedPolicy};
use std::f64::consts::SQRT_2;

const DISTANCE_EPS: f64 = 1e-9;

/// Orthogonal moves first so that 4-connectivity is a prefix.
pub const DIRECTIONS: [(i32, i32); 8] = [
    (1, 0),
    (0, 1),
    (-1, 0),
    (0, -1),
    (1, 1),
    (-1, 1),
    (-1, -1),
    (1, -1),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Four,
    Eight,
}

impl Connectivity {
    pub fn from_degree(degree: u8) -> Result<Self, ConfigError> {
        match degree {
            4 => Ok(Connectivity::Four),
            8 => Ok(Connectivity::Eight),
            other => Err(ConfigError::InvalidConnectivity(other)),
        }
    }

    pub fn directions(self) -> &'static [(i32, i32)] {
        match self {
            Connectivity::Four => &DIRECTIONS[..4],
            Connectivity::Eight => &DIRECTIONS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    /// Index into [`DIRECTIONS`].
    Planar(u8),
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub to: GridCoord,
    pub step: Step,
    /// World length of the move; zero for layer changes.
    pub length: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GraphParams {
    pub connectivity: Connectivity,
    pub turn_penalty: f64,
    pub layer_change_cost: f64,
    pub shared_corridor_penalty: f64,
    pub soft_violation_penalty: f64,
    pub compatible_reserved: ReservedPolicy,
}

impl GraphParams {
    pub fn from_config(config: &GraphConfig) -> Result<Self, ConfigError> {
        if !config.turn_penalty.is_finite() || config.turn_penalty < 0.0 {
            return Err(ConfigError::InvalidTurnPenalty(config.turn_penalty));
        }
        Ok(Self {
            connectivity: Connectivity::from_degree(config.connectivity)?,
            turn_penalty: config.turn_penalty,
            layer_change_cost: config.layer_change_cost,
            shared_corridor_penalty: config.shared_corridor_penalty,
            soft_violation_penalty: config.soft_violation_penalty,
            compatible_reserved: config.compatible_reserved,
        })
    }
}

impl Default for GraphParams {
    fn default() -> Self {
        let c = GraphConfig::default();
        Self {
            connectivity: Connectivity::Eight,
            turn_penalty: c.turn_penalty,
            layer_change_cost: c.layer_change_cost,
            shared_corridor_penalty: c.shared_corridor_penalty,
            soft_violation_penalty: c.soft_violation_penalty,
            compatible_reserved: c.compatible_reserved,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CostScope {
    /// Obstacles, permissions, reservations and obstacle clearance.
    Full,
    /// Obstacles and permissions only.
    GeometryOnly,
}

/// The rules one net is routed under.
#[derive(Clone, Debug, PartialEq)]
pub struct NetContext {
    pub net: NetId,
    pub discipline: Discipline,
    pub clearance: f64,
    pub mode: ClearanceMode,
    pub source: GridCoord,
    pub sink: GridCoord,
    pub scope: CostScope,
}

impl NetContext {
    pub fn new(
        net: NetId,
        discipline: Discipline,
        clearance: f64,
        mode: ClearanceMode,
        source: GridCoord,
        sink: GridCoord,
    ) -> Self {
        Self {
            net,
            discipline,
            clearance,
            mode,
            source,
            sink,
            scope: CostScope::Full,
        }
    }

    pub fn geometry_only(&self) -> Self {
        Self {
            scope: CostScope::GeometryOnly,
            ..self.clone()
        }
    }
}

/// Cost of entering a cell, independent of the move that enters it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CellPenalty {
    pub cost: f64,
    pub shared: bool,
    pub violation: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EdgeCost {
    pub length: f64,
    /// Length for planar moves, the layer change cost for vertical ones.
    pub base: f64,
    pub turn: f64,
    pub clearance: f64,
    pub bend: bool,
    pub layer_change: bool,
    pub shared: bool,
    pub violation: bool,
}

impl EdgeCost {
    #[inline(always)]
    pub fn total(&self) -> f64 {
        self.base + self.turn + self.clearance
    }
}

pub struct RoutingGraph<'a, S: SpaceQuery + ?Sized> {
    space: &'a S,
    params: &'a GraphParams,
    table: &'a DisciplineTable,
}

impl<'a, S: SpaceQuery + ?Sized> RoutingGraph<'a, S> {
    pub fn new(space: &'a S, params: &'a GraphParams, table: &'a DisciplineTable) -> Self {
        Self {
            space,
            params,
            table,
        }
    }

    pub fn space(&self) -> &'a S {
        self.space
    }

    pub fn params(&self) -> &'a GraphParams {
        self.params
    }

    pub fn neighbors(&self, node: GridCoord) -> Vec<Neighbor> {
        let mut out = Vec::with_capacity(10);
        self.neighbors_into(node, &mut out);
        out
    }

    /// Structural neighbours of `node`, ignoring who may enter them.
    /// Diagonals that squeeze between two obstacle cells are left out.
    pub fn neighbors_into(&self, node: GridCoord, out: &mut Vec<Neighbor>) {
        out.clear();
        let res = self.space.resolution();
        for (d, &(dx, dy)) in self.params.connectivity.directions().iter().enumerate() {
            let Some(to) = node.offset(dx, dy) else {
                continue;
            };
            if !self.space.in_bounds(to) {
                continue;
            }
            let diagonal = dx != 0 && dy != 0;
            if diagonal {
                let side_a = GridCoord::new(to.x, node.y, node.z);
                let side_b = GridCoord::new(node.x, to.y, node.z);
                if self.space.is_obstacle(side_a) && self.space.is_obstacle(side_b) {
                    continue;
                }
            }
            out.push(Neighbor {
                to,
                step: Step::Planar(d as u8),
                length: if diagonal { res * SQRT_2 } else { res },
            });
        }

        if !self.space.is_transfer(node) {
            return;
        }
        if node.z + 1 < self.space.layers() {
            let up = GridCoord::new(node.x, node.y, node.z + 1);
            if self.space.is_transfer(up) {
                out.push(Neighbor {
                    to: up,
                    step: Step::Up,
                    length: 0.0,
                });
            }
        }
        if node.z > 0 {
            let down = GridCoord::new(node.x, node.y, node.z - 1);
            if self.space.is_transfer(down) {
                out.push(Neighbor {
                    to: down,
                    step: Step::Down,
                    length: 0.0,
                });
            }
        }
    }

    /// `None` when the net may not enter `c` at all.
    pub fn cell_cost(&self, c: GridCoord, ctx: &NetContext) -> Option<CellPenalty> {
        let occupancy = self.space.occupancy(c);
        if occupancy == Occupancy::Obstacle || !self.space.permitted(c).contains(ctx.discipline) {
            return None;
        }
        let mut penalty = CellPenalty::default();
        if ctx.scope == CostScope::GeometryOnly {
            return Some(penalty);
        }

        if let Occupancy::Reserved { net, discipline } = occupancy
            && net != ctx.net
        {
            let shareable = self.params.compatible_reserved == ReservedPolicy::Penalized
                && self.table.compatible(discipline, ctx.discipline);
            if shareable {
                penalty.cost += self.params.shared_corridor_penalty;
                penalty.shared = true;
                penalty.violation = ctx.mode == ClearanceMode::Soft;
            } else {
                self.violate(&mut penalty, ctx)?;
            }
        }

        let required = self
            .space
            .clearance_override(c, ctx.discipline)
            .unwrap_or(ctx.clearance);
        if self.space.obstacle_distance(c) + DISTANCE_EPS < required
            && !self.near_terminal(c, ctx, required)
        {
            self.violate(&mut penalty, ctx)?;
        }
        Some(penalty)
    }

    fn violate(&self, penalty: &mut CellPenalty, ctx: &NetContext) -> Option<()> {
        match ctx.mode {
            ClearanceMode::Hard => None,
            ClearanceMode::Soft => {
                penalty.cost += self.params.soft_violation_penalty;
                penalty.violation = true;
                Some(())
            }
        }
    }

    // Terminals sit on equipment faces; the run must be able to leave them.
    fn near_terminal(&self, c: GridCoord, ctx: &NetContext, radius: f64) -> bool {
        let res = self.space.resolution();
        [ctx.source, ctx.sink].iter().any(|t| {
            if t.z != c.z {
                return false;
            }
            let dx = (t.x as f64 - c.x as f64) * res;
            let dy = (t.y as f64 - c.y as f64) * res;
            (dx * dx + dy * dy).sqrt() <= radius + DISTANCE_EPS
        })
    }

    pub fn is_passable(&self, c: GridCoord, ctx: &NetContext) -> bool {
        self.space.in_bounds(c) && self.cell_cost(c, ctx).is_some()
    }

    /// Cost of taking `nb` out of `from` after arriving along `incoming`.
    pub fn edge_cost_detail(
        &self,
        nb: &Neighbor,
        incoming: Option<u8>,
        ctx: &NetContext,
    ) -> Option<EdgeCost> {
        let cell = self.cell_cost(nb.to, ctx)?;
        let mut edge = EdgeCost {
            length: nb.length,
            clearance: cell.cost,
            shared: cell.shared,
            violation: cell.violation,
            ..Default::default()
        };
        match nb.step {
            Step::Planar(d) => {
                edge.base = nb.length;
                if incoming.is_some_and(|i| i != d) {
                    edge.turn = self.params.turn_penalty;
                    edge.bend = true;
                }
            }
            Step::Up | Step::Down => {
                edge.base = self.params.layer_change_cost;
                edge.layer_change = true;
            }
        }
        Some(edge)
    }

    /// Scalar edge cost; infinite when `to` is not a usable neighbour.
    pub fn edge_cost(
        &self,
        from: GridCoord,
        to: GridCoord,
        incoming: Option<u8>,
        ctx: &NetContext,
    ) -> f64 {
        self.step_between(from, to)
            .and_then(|nb| self.edge_cost_detail(&nb, incoming, ctx))
            .map_or(f64::INFINITY, |e| e.total())
    }

    pub fn step_between(&self, from: GridCoord, to: GridCoord) -> Option<Neighbor> {
        self.neighbors(from).into_iter().find(|n| n.to == to)
    }

    /// Straight-line length plus the unavoidable layer changes. Every planar
    /// move costs at least its length, so this never overestimates.
    #[inline]
    pub fn heuristic(&self, a: GridCoord, goal: GridCoord) -> f64 {
        let res = self.space.resolution();
        let dx = (a.x as f64 - goal.x as f64) * res;
        let dy = (a.y as f64 - goal.y as f64) * res;
        let dz = (a.z as f64 - goal.z as f64).abs();
        (dx * dx + dy * dy).sqrt() + dz * self.params.layer_change_cost
    }

    /// Replays `nodes` under `ctx`, accumulating costs in search order.
    /// `None` when any step is not a usable edge.
    pub fn evaluate(&self, nodes: &[GridCoord], ctx: &NetContext) -> Option<Path> {
        if nodes.is_empty() {
            return None;
        }
        let mut cost = CostBreakdown::default();
        let mut violation = ClearanceViolation::default();
        let mut incoming = None;
        for pair in nodes.windows(2) {
            let nb = self.step_between(pair[0], pair[1])?;
            let edge = self.edge_cost_detail(&nb, incoming, ctx)?;
            cost.length += edge.length;
            cost.turn_penalty += edge.turn;
            cost.clearance_penalty += edge.clearance;
            cost.bends += edge.bend as u32;
            if edge.layer_change {
                cost.layer_changes += 1;
                cost.layer_penalty += edge.base;
            }
            cost.shared_cells += edge.shared as u32;
            if edge.violation {
                violation.cells += 1;
                violation.magnitude += edge.clearance;
            }
            cost.total += edge.total();
            if let Step::Planar(d) = nb.step {
                incoming = Some(d);
            }
        }
        Some(Path {
            nodes: nodes.to_vec(),
            cost,
            clearance_violation: (violation.cells > 0).then_some(violation),
        })
    }
}
