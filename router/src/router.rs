use crate::algo::{AStar, SearchOutcome};
use crate::graph::{CostScope, NetContext, RoutingGraph};
use crate::grid::SpaceQuery;
use crate::path::Path;
use mep_common::db::core::{ClearanceMode, NetRole};
use serde::Serialize;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnroutableReason {
    /// Source and sink are not connected through open space.
    NoPathFound,
    /// Connected geometrically, but every connection breaks a hard clearance.
    InfeasibleClearance,
    TerminalBlocked { role: NetRole },
    ExceedsBendLimit { bends: u32, limit: u32 },
    /// Rejected at ingestion under the flag policy.
    Flagged { detail: String },
    Cancelled,
}

impl fmt::Display for UnroutableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnroutableReason::NoPathFound => f.write_str("no path found"),
            UnroutableReason::InfeasibleClearance => f.write_str("clearance cannot be satisfied"),
            UnroutableReason::TerminalBlocked { role } => write!(f, "{} terminal is blocked", role),
            UnroutableReason::ExceedsBendLimit { bends, limit } => {
                write!(f, "best path has {} bends, limit is {}", bends, limit)
            }
            UnroutableReason::Flagged { detail } => write!(f, "flagged at ingestion: {}", detail),
            UnroutableReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Per-net lifecycle: `Pending -> Searching -> Routed | Unroutable`.
/// Both end states are final for the session.
#[derive(Clone, Debug, PartialEq)]
pub enum NetState {
    Pending,
    Searching,
    Routed(Path),
    Unroutable(UnroutableReason),
}

impl NetState {
    pub fn is_final(&self) -> bool {
        matches!(self, NetState::Routed(_) | NetState::Unroutable(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            NetState::Routed(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteAttempt {
    pub outcome: Result<Path, UnroutableReason>,
    pub expansions: u64,
}

impl RouteAttempt {
    pub fn unroutable(reason: UnroutableReason) -> Self {
        Self {
            outcome: Err(reason),
            expansions: 0,
        }
    }
}

/// Routes one net at a time against a fixed view of the space.
#[derive(Clone, Default)]
pub struct Router {
    astar: AStar,
    max_bends: Option<u32>,
}

impl Router {
    pub fn new(max_bends: Option<u32>) -> Self {
        Self {
            astar: AStar::new(),
            max_bends,
        }
    }

    pub fn route<S: SpaceQuery + ?Sized>(
        &mut self,
        graph: &RoutingGraph<S>,
        ctx: &NetContext,
    ) -> RouteAttempt {
        for (role, cell) in [(NetRole::Source, ctx.source), (NetRole::Sink, ctx.sink)] {
            if !graph.is_passable(cell, ctx) {
                log::debug!("Net {}: {} terminal {:?} is blocked", ctx.net, role, cell);
                return RouteAttempt::unroutable(UnroutableReason::TerminalBlocked { role });
            }
        }
        if ctx.source == ctx.sink {
            return RouteAttempt {
                outcome: Ok(Path::single(ctx.source)),
                expansions: 0,
            };
        }

        let (outcome, stats) = self.astar.find_path(graph, ctx);
        let mut expansions = stats.expansions;

        let outcome = match outcome {
            SearchOutcome::Found { nodes, cost, .. } => match graph.evaluate(&nodes, ctx) {
                Some(path) => {
                    log::debug!(
                        "Net {}: {} cells, cost {:.3} ({} expansions, open peak {})",
                        ctx.net,
                        path.len(),
                        cost,
                        stats.expansions,
                        stats.max_open
                    );
                    match self.max_bends {
                        Some(limit) if path.cost.bends > limit => {
                            Err(UnroutableReason::ExceedsBendLimit {
                                bends: path.cost.bends,
                                limit,
                            })
                        }
                        _ => Ok(path),
                    }
                }
                None => {
                    log::error!("Net {}: search returned a path that does not replay", ctx.net);
                    Err(UnroutableReason::NoPathFound)
                }
            },
            SearchOutcome::Exhausted => {
                let (reason, extra) = self.diagnose(graph, ctx);
                expansions += extra;
                Err(reason)
            }
        };
        RouteAttempt {
            outcome,
            expansions,
        }
    }

    // Soft nets already ignore reservations and clearance, so only a hard
    // net can fail for clearance alone.
    fn diagnose<S: SpaceQuery + ?Sized>(
        &mut self,
        graph: &RoutingGraph<S>,
        ctx: &NetContext,
    ) -> (UnroutableReason, u64) {
        if ctx.mode == ClearanceMode::Soft || ctx.scope == CostScope::GeometryOnly {
            return (UnroutableReason::NoPathFound, 0);
        }
        let (outcome, stats) = self.astar.find_path(graph, &ctx.geometry_only());
        let reason = match outcome {
            SearchOutcome::Found { .. } => UnroutableReason::InfeasibleClearance,
            SearchOutcome::Exhausted => UnroutableReason::NoPathFound,
        };
        (reason, stats.expansions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Connectivity, GraphParams};
    use crate::grid::{CellClass, SpaceModel};
    use crate::grid::dense::BuildOptions;
    use mep_common::db::core::{Discipline, Obstacle};
    use mep_common::db::indices::NetId;
    use mep_common::geom::coord::GridCoord;
    use mep_common::geom::point::Point;
    use mep_common::geom::polygon::Polygon;
    use mep_common::geom::rect::Rect;
    use mep_common::util::config::DisciplineTable;

    fn floor(obstacles: &[Obstacle]) -> SpaceModel {
        let opts = BuildOptions {
            extent: Some(Rect::new(Point::new(-0.5, -0.5), Point::new(9.5, 9.5))),
            ..BuildOptions::new(1.0)
        };
        SpaceModel::build_with(obstacles, &[], &[], &[], &opts).unwrap()
    }

    fn duct(mode: ClearanceMode, source: (u32, u32), sink: (u32, u32)) -> NetContext {
        NetContext::new(
            NetId::new(1),
            Discipline::Duct,
            1.0,
            mode,
            GridCoord::new(source.0, source.1, 0),
            GridCoord::new(sink.0, sink.1, 0),
        )
    }

    fn four_connected() -> GraphParams {
        GraphParams {
            connectivity: Connectivity::Four,
            ..GraphParams::default()
        }
    }

    #[test]
    fn blocked_sink_is_reported_per_role() {
        let m = floor(&[Obstacle::new(Polygon::rect(8.5, 8.5, 9.5, 9.5))]);
        assert_eq!(m.classify(GridCoord::new(9, 9, 0)), CellClass::Obstacle);
        let table = DisciplineTable::default();
        let params = GraphParams::default();
        let g = RoutingGraph::new(&m, &params, &table);
        let attempt = Router::new(None).route(&g, &duct(ClearanceMode::Hard, (0, 0), (9, 9)));
        assert_eq!(
            attempt.outcome,
            Err(UnroutableReason::TerminalBlocked {
                role: NetRole::Sink
            })
        );
    }

    #[test]
    fn coincident_terminals_route_trivially() {
        let m = floor(&[]);
        let table = DisciplineTable::default();
        let params = GraphParams::default();
        let g = RoutingGraph::new(&m, &params, &table);
        let path = Router::new(None)
            .route(&g, &duct(ClearanceMode::Hard, (4, 4), (4, 4)))
            .outcome
            .unwrap();
        assert_eq!(path.nodes, vec![GridCoord::new(4, 4, 0)]);
        assert_eq!(path.cost.total, 0.0);
    }

    #[test]
    fn bend_limit_refuses_the_path() {
        let m = floor(&[]);
        let table = DisciplineTable::default();
        let params = four_connected();
        let g = RoutingGraph::new(&m, &params, &table);
        let ctx = duct(ClearanceMode::Hard, (0, 0), (9, 9));
        let attempt = Router::new(Some(0)).route(&g, &ctx);
        assert_eq!(
            attempt.outcome,
            Err(UnroutableReason::ExceedsBendLimit { bends: 1, limit: 0 })
        );
        assert!(Router::new(Some(1)).route(&g, &ctx).outcome.is_ok());
    }

    #[test]
    fn foreign_corridor_wall_is_a_clearance_failure() {
        let mut m = floor(&[]);
        let wall: Vec<GridCoord> = (0..10).map(|x| GridCoord::new(x, 5, 0)).collect();
        m.commit_corridor(&wall, Discipline::Pipe, 0.5, NetId::new(0));
        let table = DisciplineTable::default();
        let params = four_connected();
        let g = RoutingGraph::new(&m, &params, &table);

        let hard = Router::new(None).route(&g, &duct(ClearanceMode::Hard, (5, 0), (5, 9)));
        assert_eq!(hard.outcome, Err(UnroutableReason::InfeasibleClearance));

        let soft = Router::new(None)
            .route(&g, &duct(ClearanceMode::Soft, (5, 0), (5, 9)))
            .outcome
            .unwrap();
        let violation = soft.clearance_violation.unwrap();
        assert_eq!(violation.cells, 1);
        assert_eq!(violation.magnitude, params.soft_violation_penalty);
        assert_eq!(soft.cost.total, 9.0 + params.soft_violation_penalty);
    }

    #[test]
    fn solid_wall_is_no_path() {
        let m = floor(&[Obstacle::new(Polygon::rect(-0.5, 4.5, 9.5, 5.5))]);
        let table = DisciplineTable::default();
        let params = GraphParams::default();
        let g = RoutingGraph::new(&m, &params, &table);
        let attempt = Router::new(None).route(&g, &duct(ClearanceMode::Hard, (5, 0), (5, 9)));
        assert_eq!(attempt.outcome, Err(UnroutableReason::NoPathFound));
        assert!(attempt.expansions > 0);
    }
}
