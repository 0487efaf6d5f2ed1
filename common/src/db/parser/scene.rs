//! JSON scene ingestion.
//!
//! The geometry extraction stage delivers obstacles, zones, transfer points
//! and nets in one document. Parsing normalises terminal roles and
//! disciplines; `validate` applies the ingest policy to malformed entities.

use crate::db::core::{LayerRange, NetRole, Scene};
use crate::db::indices::{NetId, ObstacleId, ZoneId};
use crate::error::{GeometryError, RoutingError};
use crate::util::config::IngestPolicy;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Entities dropped or marked under [`IngestPolicy::Flag`].
#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    pub skipped_obstacles: Vec<(ObstacleId, GeometryError)>,
    pub skipped_zones: Vec<(ZoneId, GeometryError)>,
    pub flagged_nets: BTreeMap<NetId, GeometryError>,
}

impl IngestReport {
    pub fn is_clean(&self) -> bool {
        self.skipped_obstacles.is_empty()
            && self.skipped_zones.is_empty()
            && self.flagged_nets.is_empty()
    }
}

pub fn parse(filename: impl AsRef<Path>) -> Result<Scene, RoutingError> {
    let file = File::open(filename)?;
    let mut scene: Scene = serde_json::from_reader(BufReader::new(file))?;
    normalize(&mut scene);
    Ok(scene)
}

pub fn from_str(json: &str) -> Result<Scene, RoutingError> {
    let mut scene: Scene = serde_json::from_str(json)?;
    normalize(&mut scene);
    Ok(scene)
}

fn normalize(scene: &mut Scene) {
    for net in &mut scene.nets {
        net.source.role = NetRole::Source;
        net.sink.role = NetRole::Sink;
        if net.name.is_empty() {
            net.name = format!("net{}", net.id);
        }
    }
    if scene.layers == 0 {
        scene.layers = 1;
    }
}

/// Checks polygons, layer indices, net ids and terminal disciplines.
///
/// Under [`IngestPolicy::Reject`] the first defect is returned. Under
/// [`IngestPolicy::Flag`] bad obstacles and zones are removed from the scene
/// and bad nets are listed in the report; the nets stay in the scene.
pub fn validate(scene: &mut Scene, policy: IngestPolicy) -> Result<IngestReport, GeometryError> {
    let mut report = IngestReport::default();
    let layers = scene.layers;

    let obstacle_defects: Vec<(usize, GeometryError)> = scene
        .obstacles
        .par_iter()
        .enumerate()
        .filter_map(|(i, o)| {
            let entity = entity_name("obstacle", i, &o.name);
            if let Err(defect) = o.polygon.validate() {
                return Some((i, GeometryError::from_defect(entity, defect)));
            }
            layer_defect(entity, o.layers, layers).map(|e| (i, e))
        })
        .collect();

    let zone_defects: Vec<(usize, GeometryError)> = scene
        .zones
        .par_iter()
        .enumerate()
        .filter_map(|(i, z)| {
            let entity = entity_name("zone", i, &z.name);
            if let Err(defect) = z.polygon.validate() {
                return Some((i, GeometryError::from_defect(entity, defect)));
            }
            layer_defect(entity, z.layers, layers).map(|e| (i, e))
        })
        .collect();

    let mut seen = HashSet::new();
    let mut net_defects = Vec::new();
    for net in &scene.nets {
        if !seen.insert(net.id) {
            // Duplicate ids make outcomes ambiguous; never flaggable.
            return Err(GeometryError::DuplicateNet(net.id));
        }
        for t in [&net.source, &net.sink] {
            if t.discipline.is_some_and(|d| d != net.discipline) {
                net_defects.push((net.id, GeometryError::DisciplineMismatch { net: net.id }));
                break;
            }
            if t.layer >= layers {
                net_defects.push((
                    net.id,
                    GeometryError::LayerOutOfRange {
                        entity: format!("net {} {}", net.id, t.role),
                        layer: t.layer,
                        layers,
                    },
                ));
                break;
            }
        }
    }

    if policy == IngestPolicy::Reject {
        if let Some((_, e)) = obstacle_defects.into_iter().next() {
            return Err(e);
        }
        if let Some((_, e)) = zone_defects.into_iter().next() {
            return Err(e);
        }
        if let Some((_, e)) = net_defects.into_iter().next() {
            return Err(e);
        }
        return Ok(report);
    }

    for (i, e) in &obstacle_defects {
        log::warn!("Skipping obstacle {}: {}", i, e);
    }
    for (i, e) in &zone_defects {
        log::warn!("Skipping zone {}: {}", i, e);
    }
    let bad_obstacles: HashSet<usize> = obstacle_defects.iter().map(|(i, _)| *i).collect();
    let bad_zones: HashSet<usize> = zone_defects.iter().map(|(i, _)| *i).collect();
    scene.obstacles = std::mem::take(&mut scene.obstacles)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !bad_obstacles.contains(i))
        .map(|(_, o)| o)
        .collect();
    scene.zones = std::mem::take(&mut scene.zones)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !bad_zones.contains(i))
        .map(|(_, z)| z)
        .collect();

    report.skipped_obstacles = obstacle_defects
        .into_iter()
        .map(|(i, e)| (ObstacleId::new(i), e))
        .collect();
    report.skipped_zones = zone_defects
        .into_iter()
        .map(|(i, e)| (ZoneId::new(i), e))
        .collect();
    for (id, e) in net_defects {
        log::warn!("Flagging net {}: {}", id, e);
        report.flagged_nets.entry(id).or_insert(e);
    }
    Ok(report)
}

fn layer_defect(entity: String, range: Option<LayerRange>, layers: u8) -> Option<GeometryError> {
    match range {
        Some(r) if r.max >= layers || r.min > r.max => Some(GeometryError::LayerOutOfRange {
            entity,
            layer: r.max,
            layers,
        }),
        _ => None,
    }
}

fn entity_name(kind: &str, index: usize, name: &str) -> String {
    if name.is_empty() {
        format!("{} #{}", kind, index)
    } else {
        format!("{} '{}'", kind, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::core::Discipline;

    const SCENE: &str = r#"{
        "unit": "m",
        "extent": {"min": {"x": 0.0, "y": 0.0}, "max": {"x": 10.0, "y": 10.0}},
        "obstacles": [
            {"name": "column", "polygon": [{"x": 4.0, "y": 4.0}, {"x": 5.0, "y": 4.0}, {"x": 5.0, "y": 5.0}, {"x": 4.0, "y": 5.0}]},
            {"polygon": [{"x": 0.0, "y": 0.0}, {"x": 2.0, "y": 2.0}, {"x": 2.0, "y": 0.0}, {"x": 0.0, "y": 2.0}]}
        ],
        "zones": [
            {"name": "shaft", "polygon": [{"x": 7.0, "y": 7.0}, {"x": 9.0, "y": 7.0}, {"x": 9.0, "y": 9.0}], "permitted": ["pipe"], "clearance_override": {"pipe": 0.1}}
        ],
        "nets": [
            {"id": 0, "discipline": "duct", "source": {"point": {"x": 1.0, "y": 8.0}}, "sink": {"point": {"x": 8.0, "y": 1.0}}},
            {"id": 1, "discipline": "pipe", "mode": "soft",
             "source": {"point": {"x": 1.0, "y": 1.0}, "discipline": "duct"}, "sink": {"point": {"x": 3.0, "y": 3.0}}}
        ]
    }"#;

    #[test]
    fn parses_and_normalizes_roles() {
        let scene = from_str(SCENE).unwrap();
        assert_eq!(scene.layers, 1);
        assert_eq!(scene.nets[0].sink.role, NetRole::Sink);
        assert_eq!(scene.nets[0].name, "net0");
        assert_eq!(scene.zones[0].clearance_override[&Discipline::Pipe], 0.1);
    }

    #[test]
    fn reject_policy_fails_on_first_defect() {
        let mut scene = from_str(SCENE).unwrap();
        let err = validate(&mut scene, IngestPolicy::Reject).unwrap_err();
        assert!(matches!(err, GeometryError::SelfIntersecting { .. }));
    }

    #[test]
    fn flag_policy_drops_bad_obstacles_and_flags_nets() {
        let mut scene = from_str(SCENE).unwrap();
        let report = validate(&mut scene, IngestPolicy::Flag).unwrap();
        assert_eq!(scene.obstacles.len(), 1);
        assert_eq!(scene.obstacles[0].name, "column");
        assert_eq!(report.skipped_obstacles.len(), 1);
        assert_eq!(
            report.flagged_nets.get(&NetId::new(1)),
            Some(&GeometryError::DisciplineMismatch { net: NetId::new(1) })
        );
        assert!(!report.is_clean());
    }

    #[test]
    fn zone_on_missing_layer_is_rejected_or_skipped() {
        let mut scene = from_str(SCENE).unwrap();
        scene.obstacles.truncate(1);
        scene.nets.truncate(1);
        scene.zones[0].layers = Some(LayerRange::new(0, 2));
        assert_eq!(
            validate(&mut scene.clone(), IngestPolicy::Reject).unwrap_err(),
            GeometryError::LayerOutOfRange {
                entity: "zone 'shaft'".to_string(),
                layer: 2,
                layers: 1,
            }
        );

        let report = validate(&mut scene, IngestPolicy::Flag).unwrap();
        assert!(scene.zones.is_empty());
        assert_eq!(report.skipped_zones.len(), 1);
    }

    #[test]
    fn duplicate_net_ids_are_fatal_under_any_policy() {
        let mut scene = from_str(SCENE).unwrap();
        scene.nets[1].id = NetId::new(0);
        scene.nets[1].source.discipline = None;
        scene.obstacles.truncate(1);
        assert_eq!(
            validate(&mut scene, IngestPolicy::Flag).unwrap_err(),
            GeometryError::DuplicateNet(NetId::new(0))
        );
    }
}
