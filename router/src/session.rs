//! Net ordering, sequential commitment and the speculative batch mode.

use crate::graph::{GraphParams, NetContext, RoutingGraph};
use crate::grid::{CommitSummary, Occupancy, SpaceModel, SpaceQuery};
use crate::path::{Path, Waypoint};
use crate::router::{NetState, RouteAttempt, Router, UnroutableReason};
use mep_common::db::core::{Discipline, NetRole, NetSpec, Scene};
use mep_common::db::indices::NetId;
use mep_common::error::{ConfigError, GeometryError, RoutingError};
use mep_common::util::config::{Config, DisciplineTable, IngestPolicy};
use mep_common::util::profiler::ScopedTimer;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative stop flag, checked before each net's search.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionProgress {
    pub total: usize,
    pub processed: usize,
    pub routed: usize,
    pub unroutable: usize,
    /// Search expansions spent so far, re-searches included.
    pub expansions: u64,
    pub last: Option<NetId>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Diagnostics {
    pub nets: usize,
    pub routed: usize,
    pub unroutable: usize,
    pub cancelled: usize,
    /// Routed nets carrying a soft clearance violation.
    pub soft_violations: usize,
    pub total_length: f64,
    pub total_cost: f64,
    pub total_bends: u32,
    pub expansions: u64,
    pub reserved_cells: usize,
    /// Speculative results discarded because a commit touched their path.
    pub re_searched: usize,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoutedNet {
    pub name: String,
    pub discipline: Discipline,
    pub path: Path,
    pub waypoints: Vec<Waypoint>,
    pub reserved_cells: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NetOutcome {
    Routed(RoutedNet),
    Unroutable {
        name: String,
        discipline: Discipline,
        reason: UnroutableReason,
    },
}

impl NetOutcome {
    pub fn is_routed(&self) -> bool {
        matches!(self, NetOutcome::Routed(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            NetOutcome::Routed(r) => Some(&r.path),
            NetOutcome::Unroutable { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&UnroutableReason> {
        match self {
            NetOutcome::Routed(_) => None,
            NetOutcome::Unroutable { reason, .. } => Some(reason),
        }
    }
}

/// One entry per requested net, in id order, plus the order they were routed in.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RoutingReport {
    pub outcomes: BTreeMap<NetId, NetOutcome>,
    pub order: Vec<NetId>,
    pub diagnostics: Diagnostics,
}

impl RoutingReport {
    pub fn outcome(&self, net: NetId) -> Option<&NetOutcome> {
        self.outcomes.get(&net)
    }

    pub fn path(&self, net: NetId) -> Option<&Path> {
        self.outcome(net).and_then(NetOutcome::path)
    }

    pub fn reason(&self, net: NetId) -> Option<&UnroutableReason> {
        self.outcome(net).and_then(NetOutcome::reason)
    }

    pub fn routed(&self) -> impl Iterator<Item = (NetId, &RoutedNet)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            NetOutcome::Routed(r) => Some((*id, r)),
            NetOutcome::Unroutable { .. } => None,
        })
    }

    pub fn write_json(&self, filename: &str) -> Result<(), RoutingError> {
        let file = BufWriter::new(File::create(filename)?);
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

enum Task {
    Route(NetContext),
    Fixed(UnroutableReason),
}

#[derive(Default)]
struct Ledger {
    report: RoutingReport,
    progress: SessionProgress,
}

/// Owns the space model for one batch and commits corridors in routing order.
pub struct RoutingSession {
    space: SpaceModel,
    config: Config,
    table: DisciplineTable,
    params: GraphParams,
    flagged: BTreeMap<NetId, GeometryError>,
    states: BTreeMap<NetId, NetState>,
    cancel: CancelToken,
}

impl RoutingSession {
    pub fn new(scene: &Scene, config: &Config) -> Result<Self, RoutingError> {
        let _timer = ScopedTimer::new("Space model build");
        config.validate()?;
        config.validate_for_nets(&scene.nets)?;
        config.validate_zones(&scene.zones)?;
        let (space, ingest) = SpaceModel::from_scene(scene, &config.space)?;
        let mut session = Self::with_space(space, config)?;
        session.flagged = ingest.flagged_nets;
        Ok(session)
    }

    pub fn with_space(space: SpaceModel, config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            space,
            config: config.clone(),
            table: config.discipline_table(),
            params: GraphParams::from_config(&config.graph)?,
            flagged: BTreeMap::new(),
            states: BTreeMap::new(),
            cancel: CancelToken::default(),
        })
    }

    pub fn space(&self) -> &SpaceModel {
        &self.space
    }

    pub fn table(&self) -> &DisciplineTable {
        &self.table
    }

    pub fn states(&self) -> &BTreeMap<NetId, NetState> {
        &self.states
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Routing order: discipline rank, then net priority, then id.
    pub fn ordered<'n>(&self, nets: &'n [NetSpec]) -> Vec<&'n NetSpec> {
        let mut ordered: Vec<&NetSpec> = nets.iter().collect();
        ordered.sort_by_key(|n| (self.table.priority(n.discipline), n.priority, n.id));
        ordered
    }

    pub fn run(&mut self, nets: &[NetSpec]) -> Result<RoutingReport, RoutingError> {
        self.run_with_progress(nets, |_| {})
    }

    /// Routes `nets` in priority order. Every input net appears in the report.
    /// Batch-level problems are returned before any corridor is committed.
    pub fn run_with_progress<F>(
        &mut self,
        nets: &[NetSpec],
        mut observer: F,
    ) -> Result<RoutingReport, RoutingError>
    where
        F: FnMut(&SessionProgress),
    {
        let timer = ScopedTimer::new("Routing batch");
        self.config.validate_for_nets(nets)?;
        let mut seen = HashSet::new();
        if let Some(dup) = nets.iter().find(|n| !seen.insert(n.id)) {
            return Err(GeometryError::DuplicateNet(dup.id).into());
        }

        let mut tasks = Vec::with_capacity(nets.len());
        for net in self.ordered(nets) {
            let task = match self.flagged.get(&net.id) {
                Some(e) => Task::Fixed(UnroutableReason::Flagged {
                    detail: e.to_string(),
                }),
                None => match self.resolve(net) {
                    Ok(ctx) => Task::Route(ctx),
                    Err(e) if self.config.space.ingest_policy == IngestPolicy::Flag => {
                        log::warn!("Flagging net {}: {}", net.id, e);
                        Task::Fixed(UnroutableReason::Flagged {
                            detail: e.to_string(),
                        })
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            tasks.push((net, task));
        }
        for (net, _) in &tasks {
            self.states.insert(net.id, NetState::Pending);
        }

        let mut ledger = Ledger::default();
        ledger.progress.total = tasks.len();
        ledger.report.diagnostics.nets = tasks.len();

        let speculative = self.config.search.speculative;
        log::info!(
            "Routing {} nets ({})...",
            tasks.len(),
            if speculative { "speculative" } else { "sequential" }
        );
        if speculative {
            self.run_speculative(&tasks, &mut ledger, &mut observer);
        } else {
            self.run_sequential(&tasks, &mut ledger, &mut observer);
        }

        let mut report = ledger.report;
        report.diagnostics.reserved_cells = self.space.total_reserved();
        report.diagnostics.elapsed_ms = timer.elapsed().as_millis() as u64;
        log::info!(
            "Routed {}/{} nets, {} unroutable, {} with soft violations, length {:.2}, {} ms",
            report.diagnostics.routed,
            report.diagnostics.nets,
            report.diagnostics.unroutable,
            report.diagnostics.soft_violations,
            report.diagnostics.total_length,
            report.diagnostics.elapsed_ms
        );
        Ok(report)
    }

    fn resolve(&self, net: &NetSpec) -> Result<NetContext, GeometryError> {
        let locate = |role: NetRole| {
            let t = net.terminal(role);
            let c = self
                .space
                .cell_of(t.point, t.layer)
                .ok_or(GeometryError::TerminalOutOfBounds { net: net.id, role })?;
            let blocked = self.space.occupancy(c) == Occupancy::Obstacle
                || !self.space.permitted(c).contains(net.discipline);
            if blocked {
                return Err(GeometryError::TerminalBlocked { net: net.id, role });
            }
            Ok(c)
        };
        let source = locate(NetRole::Source)?;
        let sink = locate(NetRole::Sink)?;
        Ok(NetContext::new(
            net.id,
            net.discipline,
            self.table.net_clearance(net),
            net.mode,
            source,
            sink,
        ))
    }

    fn run_sequential(
        &mut self,
        tasks: &[(&NetSpec, Task)],
        ledger: &mut Ledger,
        observer: &mut dyn FnMut(&SessionProgress),
    ) {
        let mut router = Router::new(self.config.search.max_bends);
        for (net, task) in tasks {
            let attempt = if self.cancel.is_cancelled() {
                RouteAttempt::unroutable(UnroutableReason::Cancelled)
            } else {
                match task {
                    Task::Fixed(reason) => RouteAttempt::unroutable(reason.clone()),
                    Task::Route(ctx) => {
                        self.states.insert(net.id, NetState::Searching);
                        let graph = RoutingGraph::new(&self.space, &self.params, &self.table);
                        router.route(&graph, ctx)
                    }
                }
            };
            self.finish(net, task, attempt, ledger, observer);
        }
    }

    /// Searches each batch in parallel against the current space, then
    /// commits in order. A path is re-searched when an earlier commit in
    /// the batch touched one of its cells; commits only raise costs, so
    /// untouched paths stay optimal and failures stay failures.
    fn run_speculative(
        &mut self,
        tasks: &[(&NetSpec, Task)],
        ledger: &mut Ledger,
        observer: &mut dyn FnMut(&SessionProgress),
    ) {
        let batch = self.config.search.speculative_batch.max(1);
        let max_bends = self.config.search.max_bends;
        let mut router = Router::new(max_bends);

        for chunk in tasks.chunks(batch) {
            if self.cancel.is_cancelled() {
                for (net, task) in chunk {
                    let attempt = RouteAttempt::unroutable(UnroutableReason::Cancelled);
                    self.finish(net, task, attempt, ledger, observer);
                }
                continue;
            }

            let snapshot = self.space.epoch();
            for (net, task) in chunk {
                if matches!(task, Task::Route(_)) {
                    self.states.insert(net.id, NetState::Searching);
                }
            }
            let speculated: Vec<Option<RouteAttempt>> = {
                let graph = RoutingGraph::new(&self.space, &self.params, &self.table);
                chunk
                    .par_iter()
                    .map_with(Router::new(max_bends), |router, (_, task)| match task {
                        Task::Route(ctx) => Some(router.route(&graph, ctx)),
                        Task::Fixed(_) => None,
                    })
                    .collect()
            };

            // Set when a commit frees cells, which may lower other costs.
            let mut invalidated = false;
            for ((net, task), guess) in chunk.iter().zip(speculated) {
                let attempt = if self.cancel.is_cancelled() {
                    RouteAttempt::unroutable(UnroutableReason::Cancelled)
                } else {
                    match (task, guess) {
                        (Task::Fixed(reason), _) => RouteAttempt::unroutable(reason.clone()),
                        (Task::Route(_), Some(guess))
                            if !invalidated && !self.is_stale(&guess, snapshot) =>
                        {
                            guess
                        }
                        (Task::Route(ctx), guess) => {
                            if let Some(g) = guess {
                                ledger.report.diagnostics.re_searched += 1;
                                ledger.report.diagnostics.expansions += g.expansions;
                            }
                            let graph = RoutingGraph::new(&self.space, &self.params, &self.table);
                            router.route(&graph, ctx)
                        }
                    }
                };
                let summary = self.finish(net, task, attempt, ledger, observer);
                invalidated |= summary.released > 0;
            }
        }
    }

    /// A bend-limit failure depends on which path is cheapest, and any
    /// commit can change that. Other failures only get worse as cells
    /// are taken.
    fn is_stale(&self, attempt: &RouteAttempt, snapshot: u32) -> bool {
        match &attempt.outcome {
            Ok(path) => path
                .nodes
                .iter()
                .any(|c| self.space.cell_epoch(*c) > snapshot),
            Err(UnroutableReason::ExceedsBendLimit { .. }) => self.space.epoch() > snapshot,
            Err(_) => false,
        }
    }

    fn finish(
        &mut self,
        net: &NetSpec,
        task: &Task,
        attempt: RouteAttempt,
        ledger: &mut Ledger,
        observer: &mut dyn FnMut(&SessionProgress),
    ) -> CommitSummary {
        let diag = &mut ledger.report.diagnostics;
        diag.expansions += attempt.expansions;
        let mut summary = CommitSummary::default();

        let (outcome, state) = match attempt.outcome {
            Ok(path) => {
                debug_assert!(path.nodes.iter().all(|c| !self.space.is_obstacle(*c)));
                let radius = match task {
                    Task::Route(ctx) => ctx.clearance,
                    Task::Fixed(_) => self.table.net_clearance(net),
                };
                summary = self
                    .space
                    .commit_corridor(&path.nodes, net.discipline, radius, net.id);
                diag.routed += 1;
                diag.total_length += path.cost.length;
                diag.total_cost += path.cost.total;
                diag.total_bends += path.cost.bends;
                if let Some(v) = &path.clearance_violation {
                    diag.soft_violations += 1;
                    log::warn!(
                        "Net {} ({}) routed with {} clearance violations",
                        net.id,
                        net.name,
                        v.cells
                    );
                }
                let routed = RoutedNet {
                    name: net.name.clone(),
                    discipline: net.discipline,
                    waypoints: path.waypoints(&self.space),
                    reserved_cells: summary.reserved,
                    path: path.clone(),
                };
                (NetOutcome::Routed(routed), NetState::Routed(path))
            }
            Err(reason) => (
                self.unroutable(net, reason.clone(), diag),
                NetState::Unroutable(reason),
            ),
        };

        self.states.insert(net.id, state);
        ledger.report.outcomes.insert(net.id, outcome);
        ledger.report.order.push(net.id);

        let progress = &mut ledger.progress;
        progress.processed += 1;
        progress.expansions = ledger.report.diagnostics.expansions;
        if ledger.report.outcomes.get(&net.id).is_some_and(NetOutcome::is_routed) {
            progress.routed += 1;
        } else {
            progress.unroutable += 1;
        }
        progress.last = Some(net.id);
        observer(progress);
        summary
    }

    fn unroutable(
        &self,
        net: &NetSpec,
        reason: UnroutableReason,
        diag: &mut Diagnostics,
    ) -> NetOutcome {
        diag.unroutable += 1;
        if reason == UnroutableReason::Cancelled {
            diag.cancelled += 1;
        } else {
            log::warn!("Net {} ({}) unroutable: {}", net.id, net.name, reason);
        }
        NetOutcome::Unroutable {
            name: net.name.clone(),
            discipline: net.discipline,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mep_common::db::core::Obstacle;
    use mep_common::geom::point::Point;
    use mep_common::geom::polygon::Polygon;
    use mep_common::geom::rect::Rect;

    fn scene() -> Scene {
        Scene::new(Rect::new(Point::new(-0.5, -0.5), Point::new(9.5, 9.5)))
    }

    fn config() -> Config {
        let mut c = Config::default();
        c.space.resolution = 1.0;
        c
    }

    fn net(id: usize, d: Discipline, a: (f64, f64), b: (f64, f64)) -> NetSpec {
        NetSpec::new(id, d, Point::new(a.0, a.1), Point::new(b.0, b.1)).with_clearance(1.0)
    }

    #[test]
    fn ordering_uses_discipline_rank_then_priority_then_id() {
        let mut s = scene();
        s.nets = vec![
            net(0, Discipline::Conduit, (0.0, 0.0), (1.0, 0.0)),
            net(1, Discipline::Duct, (0.0, 1.0), (1.0, 1.0)).with_priority(5),
            net(2, Discipline::Duct, (0.0, 2.0), (1.0, 2.0)),
            net(3, Discipline::Pipe, (0.0, 3.0), (1.0, 3.0)),
        ];
        let session = RoutingSession::new(&s, &config()).unwrap();
        let order: Vec<usize> = session.ordered(&s.nets).iter().map(|n| n.id.index()).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }

    #[test]
    fn terminal_inside_obstacle_rejects_the_batch() {
        let mut s = scene();
        s.obstacles.push(Obstacle::new(Polygon::rect(3.5, 3.5, 5.5, 5.5)));
        s.nets = vec![
            net(0, Discipline::Duct, (0.0, 0.0), (9.0, 0.0)),
            net(1, Discipline::Duct, (4.0, 4.0), (9.0, 9.0)),
        ];
        let mut session = RoutingSession::new(&s, &config()).unwrap();
        let err = session.run(&s.nets).unwrap_err();
        assert!(matches!(
            err,
            RoutingError::Geometry(GeometryError::TerminalBlocked {
                role: NetRole::Source,
                ..
            })
        ));
        assert_eq!(session.space().total_reserved(), 0);
    }

    #[test]
    fn flag_policy_reports_bad_terminals_and_routes_the_rest() {
        let mut s = scene();
        s.obstacles.push(Obstacle::new(Polygon::rect(3.5, 3.5, 5.5, 5.5)));
        s.nets = vec![
            net(0, Discipline::Duct, (0.0, 0.0), (9.0, 0.0)),
            net(1, Discipline::Duct, (4.0, 4.0), (9.0, 9.0)),
            net(2, Discipline::Duct, (0.0, 9.0), (42.0, 9.0)),
        ];
        let mut cfg = config();
        cfg.space.ingest_policy = IngestPolicy::Flag;
        let mut session = RoutingSession::new(&s, &cfg).unwrap();
        let report = session.run(&s.nets).unwrap();
        assert!(report.outcome(NetId::new(0)).unwrap().is_routed());
        assert!(matches!(
            report.reason(NetId::new(1)),
            Some(UnroutableReason::Flagged { .. })
        ));
        assert!(matches!(
            report.reason(NetId::new(2)),
            Some(UnroutableReason::Flagged { .. })
        ));
        assert_eq!(report.outcomes.len(), 3);
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let s = scene();
        let nets = vec![
            net(4, Discipline::Duct, (0.0, 0.0), (1.0, 0.0)),
            net(4, Discipline::Pipe, (0.0, 1.0), (1.0, 1.0)),
        ];
        let mut session = RoutingSession::new(&s, &config()).unwrap();
        assert!(matches!(
            session.run(&nets),
            Err(RoutingError::Geometry(GeometryError::DuplicateNet(_)))
        ));
    }

    #[test]
    fn coarse_grid_is_a_config_error() {
        let mut s = scene();
        s.nets = vec![net(0, Discipline::Duct, (0.0, 0.0), (1.0, 0.0)).with_clearance(0.5)];
        assert!(matches!(
            RoutingSession::new(&s, &config()),
            Err(RoutingError::Config(ConfigError::ResolutionTooCoarse { .. }))
        ));
    }

    #[test]
    fn zone_override_finer_than_grid_is_a_config_error() {
        let mut s = scene();
        let mut over = BTreeMap::new();
        over.insert(Discipline::Pipe, 0.01);
        s.zones.push(mep_common::db::core::Zone {
            name: "plant".to_string(),
            polygon: Polygon::rect(1.5, 1.5, 4.5, 4.5),
            permitted: mep_common::db::core::DisciplineSet::ALL,
            clearance_override: over,
            layers: None,
        });
        s.nets = vec![net(0, Discipline::Pipe, (0.0, 0.0), (9.0, 9.0))];
        assert!(matches!(
            RoutingSession::new(&s, &config()),
            Err(RoutingError::Config(ConfigError::ResolutionTooCoarse { .. }))
        ));
    }

    #[test]
    fn progress_reaches_every_net_and_states_are_final() {
        let mut s = scene();
        s.nets = (0..4)
            .map(|i| net(i, Discipline::Pipe, (0.0, 2.0 * i as f64), (9.0, 2.0 * i as f64)))
            .collect();
        let mut session = RoutingSession::new(&s, &config()).unwrap();
        let mut seen = Vec::new();
        let report = session
            .run_with_progress(&s.nets, |p| seen.push(p.processed))
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(report.diagnostics.routed + report.diagnostics.unroutable, 4);
        assert!(session.states().values().all(NetState::is_final));
    }

    #[test]
    fn report_serializes_with_status_tags() {
        let mut s = scene();
        s.nets = vec![net(0, Discipline::Duct, (0.0, 0.0), (3.0, 0.0))];
        let mut session = RoutingSession::new(&s, &config()).unwrap();
        let report = session.run(&s.nets).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"]["0"]["status"], "routed");
        assert_eq!(json["outcomes"]["0"]["waypoints"].as_array().unwrap().len(), 2);
    }
}
