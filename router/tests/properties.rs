use mep_common::db::core::{Discipline, LayerRange, NetSpec, Obstacle, Scene, TransferPoint};
use mep_common::db::indices::NetId;
use mep_common::geom::point::Point;
use mep_common::geom::polygon::Polygon;
use mep_common::geom::rect::Rect;
use mep_common::util::config::{Config, IngestPolicy};
use mep_common::util::generator::{SceneParams, random_scene};
use mep_router::graph::Connectivity;
use mep_router::grid::SpaceQuery;
use mep_router::{RoutingReport, RoutingSession};
use proptest::prelude::*;

fn floor() -> Scene {
    Scene::new(Rect::new(Point::new(-0.5, -0.5), Point::new(9.5, 9.5)))
}

fn grid_config(connectivity: u8, turn_penalty: f64) -> Config {
    let mut c = Config::default();
    c.space.resolution = 1.0;
    c.graph.connectivity = connectivity;
    c.graph.turn_penalty = turn_penalty;
    c
}

fn net(id: usize, d: Discipline, a: (u32, u32), b: (u32, u32)) -> NetSpec {
    NetSpec::new(
        id,
        d,
        Point::new(a.0 as f64, a.1 as f64),
        Point::new(b.0 as f64, b.1 as f64),
    )
    .with_clearance(1.0)
}

fn generated(seed: u64) -> (Scene, Config) {
    let scene = random_scene(&SceneParams {
        size: 12.0,
        obstacles: 8,
        nets: 6,
        layers: 2,
        seed,
    });
    let mut config = Config::default();
    config.space.ingest_policy = IngestPolicy::Flag;
    (scene, config)
}

fn route(scene: &Scene, config: &Config) -> (RoutingSession, RoutingReport) {
    let mut session = RoutingSession::new(scene, config).unwrap();
    let report = session.run(&scene.nets).unwrap();
    (session, report)
}

fn cell() -> impl Strategy<Value = (u32, u32)> {
    (0u32..10, 0u32..10)
}

proptest! {
    #[test]
    fn four_connected_cost_is_manhattan(a in cell(), b in cell()) {
        let mut scene = floor();
        scene.nets = vec![net(0, Discipline::Duct, a, b)];
        let (_, report) = route(&scene, &grid_config(4, 0.0));
        let path = report.path(NetId::new(0)).unwrap();
        let manhattan = a.0.abs_diff(b.0) + a.1.abs_diff(b.1);
        prop_assert_eq!(path.cost.total, manhattan as f64);
        prop_assert_eq!(path.len(), manhattan as usize + 1);
    }

    #[test]
    fn eight_connected_cost_is_octile(a in cell(), b in cell()) {
        let mut scene = floor();
        scene.nets = vec![net(0, Discipline::Duct, a, b)];
        let (_, report) = route(&scene, &grid_config(8, 0.0));
        let path = report.path(NetId::new(0)).unwrap();
        let (dx, dy) = (a.0.abs_diff(b.0) as f64, a.1.abs_diff(b.1) as f64);
        let octile = dx.max(dy) - dx.min(dy) + std::f64::consts::SQRT_2 * dx.min(dy);
        prop_assert!((path.cost.total - octile).abs() < 1e-9);
    }

    #[test]
    fn committed_reservations_only_grow(
        ends in prop::collection::vec((cell(), cell()), 1..6)
    ) {
        let scene = floor();
        let mut session = RoutingSession::new(&scene, &grid_config(8, 1.0)).unwrap();
        let mut held: Vec<(NetId, Vec<_>)> = Vec::new();
        let mut total = 0;
        for (i, (a, b)) in ends.into_iter().enumerate() {
            let spec = net(i, Discipline::Pipe, a, b);
            session.run(std::slice::from_ref(&spec)).unwrap();
            let now = session.space().total_reserved();
            prop_assert!(now >= total);
            total = now;
            for (id, cells) in &held {
                prop_assert_eq!(&session.space().reserved_cells(*id), cells);
            }
            held.push((spec.id, session.space().reserved_cells(spec.id)));
        }
    }

    #[test]
    fn appending_a_net_never_shrinks_the_reservation(
        ends in prop::collection::vec((cell(), cell()), 1..5),
        extra in (cell(), cell()),
    ) {
        let mut scene = floor();
        scene.nets = ends
            .iter()
            .enumerate()
            .map(|(i, (a, b))| net(i, Discipline::Pipe, *a, *b))
            .collect();
        let config = grid_config(8, 1.0);
        let (before, shorter) = route(&scene, &config);

        scene.nets.push(net(ends.len(), Discipline::Pipe, extra.0, extra.1));
        let (after, longer) = route(&scene, &config);

        prop_assert!(after.space().total_reserved() >= before.space().total_reserved());
        for id in shorter.outcomes.keys() {
            prop_assert_eq!(
                serde_json::to_string(&shorter.outcomes[id]).unwrap(),
                serde_json::to_string(&longer.outcomes[id]).unwrap()
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn generated_scenes_verify_and_avoid_obstacles(seed in 0u64..1000) {
        let (scene, config) = generated(seed);
        let (session, report) = route(&scene, &config);
        prop_assert_eq!(report.outcomes.len(), scene.nets.len());
        for (_, routed) in report.routed() {
            prop_assert!(routed.path.nodes.iter().all(|c| !session.space().is_obstacle(*c)));
        }
        let verdict = mep_router::check::run(session.space(), &scene.nets, &report, Connectivity::Eight);
        prop_assert!(verdict.is_ok(), "{:?}", verdict);
    }
}

#[test]
fn identical_inputs_give_identical_reports() {
    let (scene, config) = generated(7);
    let (_, first) = route(&scene, &config);
    let (_, second) = route(&scene, &config);
    assert_eq!(
        serde_json::to_string(&first.outcomes).unwrap(),
        serde_json::to_string(&second.outcomes).unwrap()
    );
    assert_eq!(first.order, second.order);
}

#[test]
fn speculative_batches_match_sequential_routing() {
    let mut scene = floor();
    scene.nets = vec![
        net(0, Discipline::Pipe, (0, 0), (9, 0)),
        net(1, Discipline::Duct, (0, 3), (9, 3)),
        net(2, Discipline::Conduit, (0, 6), (9, 6)),
        net(3, Discipline::Pipe, (0, 9), (9, 9)),
    ];
    let sequential = grid_config(8, 1.0);
    let mut speculative = sequential.clone();
    speculative.search.speculative = true;
    speculative.search.speculative_batch = 2;

    let (_, a) = route(&scene, &sequential);
    let (_, b) = route(&scene, &speculative);
    assert_eq!(a.order, b.order);
    for id in a.outcomes.keys() {
        assert_eq!(a.path(*id).unwrap().cost, b.path(*id).unwrap().cost);
    }
    assert_eq!(b.diagnostics.re_searched, 0);
}

#[test]
fn speculative_paths_crossing_a_commit_are_searched_again() {
    let mut scene = floor();
    scene.nets = vec![
        net(1, Discipline::Duct, (2, 5), (7, 5)),
        net(2, Discipline::Pipe, (5, 0), (5, 9)),
    ];
    let sequential = grid_config(4, 0.0);
    let mut speculative = sequential.clone();
    speculative.search.speculative = true;

    let (seq_session, a) = route(&scene, &sequential);
    let (spec_session, b) = route(&scene, &speculative);
    assert_eq!(b.diagnostics.re_searched, 1);
    assert_eq!(
        serde_json::to_string(&a.outcomes).unwrap(),
        serde_json::to_string(&b.outcomes).unwrap()
    );
    assert_eq!(
        seq_session.space().total_reserved(),
        spec_session.space().total_reserved()
    );
}

#[test]
fn speculative_bend_limit_failures_are_searched_again_after_a_commit() {
    let mut scene = floor();
    scene.layers = 2;
    for x in [1.0, 8.0] {
        scene.transfers.push(TransferPoint {
            point: Point::new(x, 5.0),
            layers: None,
        });
    }
    let mut column = Obstacle::new(Polygon::rect(3.5, 4.5, 4.5, 5.5));
    column.layers = Some(LayerRange::new(0, 0));
    scene.obstacles.push(column);
    scene.nets = vec![
        net(0, Discipline::Duct, (3, 0), (3, 9)),
        net(1, Discipline::Pipe, (1, 5), (8, 5)),
    ];
    let mut sequential = grid_config(4, 1.0);
    sequential.search.max_bends = Some(0);
    let mut speculative = sequential.clone();
    speculative.search.speculative = true;

    let (_, a) = route(&scene, &sequential);
    let (_, b) = route(&scene, &speculative);
    let riser_run = a.path(NetId::new(1)).unwrap();
    assert_eq!(riser_run.cost.bends, 0);
    assert_eq!(riser_run.cost.layer_changes, 2);
    assert_eq!(b.diagnostics.re_searched, 1);
    assert_eq!(
        serde_json::to_string(&a.outcomes).unwrap(),
        serde_json::to_string(&b.outcomes).unwrap()
    );
}
