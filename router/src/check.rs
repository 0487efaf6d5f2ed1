//! Post-route verification of a [`RoutingReport`] against the space it was
//! routed in.

use crate::graph::Connectivity;
use crate::grid::{Occupancy, SpaceModel, SpaceQuery};
use crate::path::count_bends;
use crate::session::{RoutedNet, RoutingReport};
use mep_common::db::core::{NetRole, NetSpec};
use mep_common::db::indices::NetId;
use rayon::prelude::*;
use std::collections::HashMap;

pub fn run(
    space: &SpaceModel,
    nets: &[NetSpec],
    report: &RoutingReport,
    connectivity: Connectivity,
) -> Result<(), String> {
    log::info!("Starting route verification...");
    let specs: HashMap<NetId, &NetSpec> = nets.iter().map(|n| (n.id, n)).collect();
    let routed: Vec<(NetId, &RoutedNet)> = report.routed().collect();

    let (continuity, occupancy) = rayon::join(
        || check_continuity(space, &specs, &routed, connectivity),
        || check_occupancy(space, &routed),
    );

    let mut msgs = Vec::new();
    match continuity {
        Err(e) => {
            log::error!("\x1b[31mFAIL\x1b[0m: Broken or misplaced runs");
            log::error!("{}", e);
            msgs.push(e);
        }
        Ok(_) => log::info!("\x1b[32mPASS\x1b[0m: Every run joins its terminals."),
    }
    match occupancy {
        Err(e) => {
            log::error!("\x1b[31mFAIL\x1b[0m: Runs through blocked or foreign space");
            log::error!("{}", e);
            msgs.push(e);
        }
        Ok(_) => log::info!("\x1b[32mPASS\x1b[0m: No run crosses an obstacle or a closed zone."),
    }

    let missing: Vec<NetId> = nets
        .iter()
        .map(|n| n.id)
        .filter(|id| report.outcome(*id).is_none())
        .collect();
    if !missing.is_empty() {
        let e = format!("Nets missing from report: {:?}", missing);
        log::error!("\x1b[31mFAIL\x1b[0m: {}", e);
        msgs.push(e);
    }

    if msgs.is_empty() {
        log::info!("\x1b[32mSUCCESS\x1b[0m: {} routed nets verified", routed.len());
        Ok(())
    } else {
        log::error!("\x1b[31mFAILURE\x1b[0m: {} check(s) failed", msgs.len());
        Err(msgs.join("; "))
    }
}

fn check_continuity(
    space: &SpaceModel,
    specs: &HashMap<NetId, &NetSpec>,
    routed: &[(NetId, &RoutedNet)],
    connectivity: Connectivity,
) -> Result<(), String> {
    let errors: Vec<String> = routed
        .par_iter()
        .filter_map(|(id, r)| {
            let nodes = &r.path.nodes;
            let spec = specs.get(id)?;
            for (role, node) in [
                (NetRole::Source, nodes.first()),
                (NetRole::Sink, nodes.last()),
            ] {
                let t = spec.terminal(role);
                let expected = space.cell_of(t.point, t.layer);
                if node.copied() != expected {
                    return Some(format!("net {}: {} end is {:?}, expected {:?}", id, role, node, expected));
                }
            }
            for (i, pair) in nodes.windows(2).enumerate() {
                let (a, b) = (pair[0], pair[1]);
                let dx = (b.x as i64 - a.x as i64).abs();
                let dy = (b.y as i64 - a.y as i64).abs();
                let dz = (b.z as i16 - a.z as i16).abs();
                let planar = dz == 0
                    && dx <= 1
                    && dy <= 1
                    && dx + dy > 0
                    && (connectivity == Connectivity::Eight || dx + dy == 1);
                let layer = dz == 1 && dx == 0 && dy == 0 && space.is_transfer(a) && space.is_transfer(b);
                if !planar && !layer {
                    return Some(format!("net {}: illegal step {} from {:?} to {:?}", id, i, a, b));
                }
            }
            let bends = count_bends(nodes);
            if bends != r.path.cost.bends {
                return Some(format!(
                    "net {}: run has {} bends, report says {}",
                    id, bends, r.path.cost.bends
                ));
            }
            None
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("\n"))
    }
}

fn check_occupancy(space: &SpaceModel, routed: &[(NetId, &RoutedNet)]) -> Result<(), String> {
    let errors: Vec<String> = routed
        .par_iter()
        .filter_map(|(id, r)| {
            if let Some(c) = r
                .path
                .nodes
                .iter()
                .find(|c| space.is_obstacle(**c) || !space.permitted(**c).contains(r.discipline))
            {
                return Some(format!("net {}: cell {:?} is closed to {}", id, c, r.discipline));
            }
            let foreign = space
                .reserved_cells(*id)
                .into_iter()
                .find(|c| !matches!(space.occupancy(*c), Occupancy::Reserved { net, .. } if net == *id));
            foreign.map(|c| format!("net {}: reservation at {:?} is not held", id, c))
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{NetOutcome, RoutingSession};
    use mep_common::db::core::{Discipline, Scene};
    use mep_common::geom::coord::GridCoord;
    use mep_common::geom::point::Point;
    use mep_common::geom::rect::Rect;
    use mep_common::util::config::Config;

    fn routed_session() -> (RoutingSession, Vec<NetSpec>, RoutingReport) {
        let mut scene = Scene::new(Rect::new(Point::new(-0.5, -0.5), Point::new(9.5, 9.5)));
        scene.nets = vec![
            NetSpec::new(0, Discipline::Duct, Point::new(0.0, 0.0), Point::new(9.0, 9.0))
                .with_clearance(1.0),
        ];
        let mut config = Config::default();
        config.space.resolution = 1.0;
        let mut session = RoutingSession::new(&scene, &config).unwrap();
        let report = session.run(&scene.nets).unwrap();
        (session, scene.nets, report)
    }

    #[test]
    fn clean_report_passes() {
        let (session, nets, report) = routed_session();
        assert!(run(session.space(), &nets, &report, Connectivity::Eight).is_ok());
    }

    #[test]
    fn gap_in_run_fails() {
        let (session, nets, mut report) = routed_session();
        if let Some(NetOutcome::Routed(r)) = report.outcomes.get_mut(&NetId::new(0)) {
            r.path.nodes.insert(1, GridCoord::new(5, 0, 0));
        }
        let err = run(session.space(), &nets, &report, Connectivity::Eight).unwrap_err();
        assert!(err.contains("illegal step"));
    }

    #[test]
    fn misreported_bends_fail() {
        let (session, nets, mut report) = routed_session();
        if let Some(NetOutcome::Routed(r)) = report.outcomes.get_mut(&NetId::new(0)) {
            r.path.cost.bends += 1;
        }
        let err = run(session.space(), &nets, &report, Connectivity::Eight).unwrap_err();
        assert!(err.contains("bends"));
    }

    #[test]
    fn diagonal_steps_fail_four_connected_check() {
        let (session, nets, report) = routed_session();
        assert!(run(session.space(), &nets, &report, Connectivity::Four).is_err());
    }
}
