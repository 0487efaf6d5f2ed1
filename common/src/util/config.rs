use crate::db::core::{Discipline, NetSpec, Zone};
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub space: SpaceConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub search: SearchConfig,
    /// Per-discipline overrides of the built-in rule table, keyed by
    /// discipline name.
    #[serde(default)]
    pub disciplines: BTreeMap<String, DisciplineRuleConfig>,
    /// Cross-discipline pairs that may share corridors. Replaces the
    /// built-in pairs when present; a discipline is always compatible
    /// with itself.
    #[serde(default)]
    pub compatibility: Option<Vec<[Discipline; 2]>>,
    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RasterMode {
    /// A cell is blocked when any part of it overlaps an obstacle.
    #[default]
    Conservative,
    /// A cell is blocked when its centre lies inside an obstacle.
    Center,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestPolicy {
    /// Any malformed entity rejects the whole batch.
    #[default]
    Reject,
    /// Malformed entities are skipped and reported; affected nets are
    /// recorded as unroutable.
    Flag,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservedPolicy {
    /// Corridors of compatible disciplines are passable at a penalty.
    #[default]
    Penalized,
    /// Every foreign corridor is treated like an incompatible one.
    Blocked,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpaceConfig {
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    #[serde(default)]
    pub raster_mode: RasterMode,
    #[serde(default)]
    pub ingest_policy: IngestPolicy,
    /// Layer count; 0 takes the count declared by the scene.
    #[serde(default)]
    pub layers: u8,
    /// Free border added around derived extents, in cells.
    #[serde(default = "default_padding_cells")]
    pub padding_cells: u32,
    #[serde(default = "default_max_cells")]
    pub max_cells: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            raster_mode: RasterMode::default(),
            ingest_policy: IngestPolicy::default(),
            layers: 0,
            padding_cells: default_padding_cells(),
            max_cells: default_max_cells(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_connectivity")]
    pub connectivity: u8,
    #[serde(default = "default_turn_penalty")]
    pub turn_penalty: f64,
    #[serde(default = "default_layer_change_cost")]
    pub layer_change_cost: f64,
    #[serde(default = "default_shared_corridor_penalty")]
    pub shared_corridor_penalty: f64,
    #[serde(default = "default_soft_violation_penalty")]
    pub soft_violation_penalty: f64,
    #[serde(default)]
    pub compatible_reserved: ReservedPolicy,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            connectivity: default_connectivity(),
            turn_penalty: default_turn_penalty(),
            layer_change_cost: default_layer_change_cost(),
            shared_corridor_penalty: default_shared_corridor_penalty(),
            soft_violation_penalty: default_soft_violation_penalty(),
            compatible_reserved: ReservedPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default)]
    pub max_bends: Option<u32>,
    #[serde(default)]
    pub speculative: bool,
    #[serde(default = "default_speculative_batch")]
    pub speculative_batch: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_bends: None,
            speculative: false,
            speculative_batch: default_speculative_batch(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DisciplineRuleConfig {
    #[serde(default)]
    pub clearance: Option<f64>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    #[serde(default = "default_scene_file")]
    pub scene_file: String,
    #[serde(default = "default_report_file")]
    pub report_file: String,
    #[serde(default)]
    pub image_file: Option<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            scene_file: default_scene_file(),
            report_file: default_report_file(),
            image_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisciplineRule {
    pub clearance: f64,
    pub priority: i32,
}

/// Resolved clearance, priority and compatibility lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct DisciplineTable {
    rules: [DisciplineRule; Discipline::COUNT],
    compatible: [[bool; Discipline::COUNT]; Discipline::COUNT],
}

const BUILTIN_RULES: [DisciplineRule; Discipline::COUNT] = [
    // Duct: largest section, claims space first.
    DisciplineRule {
        clearance: 0.4,
        priority: 0,
    },
    // Pipe
    DisciplineRule {
        clearance: 0.2,
        priority: 2,
    },
    // Conduit
    DisciplineRule {
        clearance: 0.1,
        priority: 4,
    },
    // CableTray
    DisciplineRule {
        clearance: 0.3,
        priority: 3,
    },
    // Sprinkler
    DisciplineRule {
        clearance: 0.2,
        priority: 1,
    },
];

const BUILTIN_COMPATIBLE: [[Discipline; 2]; 2] = [
    [Discipline::Conduit, Discipline::CableTray],
    [Discipline::Pipe, Discipline::Sprinkler],
];

impl DisciplineTable {
    pub fn new(
        rules: [DisciplineRule; Discipline::COUNT],
        pairs: impl IntoIterator<Item = [Discipline; 2]>,
    ) -> Self {
        let mut compatible = [[false; Discipline::COUNT]; Discipline::COUNT];
        for d in Discipline::ALL {
            compatible[d.index()][d.index()] = true;
        }
        for [a, b] in pairs {
            compatible[a.index()][b.index()] = true;
            compatible[b.index()][a.index()] = true;
        }
        Self { rules, compatible }
    }

    #[inline]
    pub fn rule(&self, d: Discipline) -> DisciplineRule {
        self.rules[d.index()]
    }

    #[inline]
    pub fn clearance(&self, d: Discipline) -> f64 {
        self.rules[d.index()].clearance
    }

    #[inline]
    pub fn priority(&self, d: Discipline) -> i32 {
        self.rules[d.index()].priority
    }

    #[inline]
    pub fn compatible(&self, a: Discipline, b: Discipline) -> bool {
        self.compatible[a.index()][b.index()]
    }

    /// Clearance a net must hold: its own override or the discipline default.
    pub fn net_clearance(&self, net: &NetSpec) -> f64 {
        net.clearance.unwrap_or_else(|| self.clearance(net.discipline))
    }
}

impl Default for DisciplineTable {
    fn default() -> Self {
        Self::new(BUILTIN_RULES, BUILTIN_COMPATIBLE)
    }
}

impl Config {
    pub fn discipline_table(&self) -> DisciplineTable {
        let mut rules = BUILTIN_RULES;
        for (name, over) in &self.disciplines {
            let Ok(d) = name.parse::<Discipline>() else {
                continue;
            };
            let rule = &mut rules[d.index()];
            if let Some(c) = over.clearance {
                rule.clearance = c;
            }
            if let Some(p) = over.priority {
                rule.priority = p;
            }
        }
        match &self.compatibility {
            Some(pairs) => DisciplineTable::new(rules, pairs.iter().copied()),
            None => DisciplineTable::new(rules, BUILTIN_COMPATIBLE),
        }
    }

    /// Parameter checks that do not depend on the batch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.graph;
        if g.connectivity != 4 && g.connectivity != 8 {
            return Err(ConfigError::InvalidConnectivity(g.connectivity));
        }
        if !g.turn_penalty.is_finite() || g.turn_penalty < 0.0 {
            return Err(ConfigError::InvalidTurnPenalty(g.turn_penalty));
        }
        for (name, value) in [
            ("layer_change_cost", g.layer_change_cost),
            ("shared_corridor_penalty", g.shared_corridor_penalty),
            ("soft_violation_penalty", g.soft_violation_penalty),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidCost { name, value });
            }
        }
        for (name, over) in &self.disciplines {
            if name.parse::<Discipline>().is_err() {
                return Err(ConfigError::UnknownDiscipline(name.clone()));
            }
            if let Some(c) = over.clearance
                && (!c.is_finite() || c <= 0.0)
            {
                return Err(ConfigError::InvalidClearance {
                    name: name.clone(),
                    value: c,
                });
            }
        }
        if self.search.speculative && self.search.speculative_batch == 0 {
            return Err(ConfigError::EmptySpeculativeBatch);
        }
        Ok(())
    }

    /// The grid must be fine enough to represent every clearance in the batch.
    pub fn validate_for_nets(&self, nets: &[NetSpec]) -> Result<(), ConfigError> {
        let table = self.discipline_table();
        let mut smallest = f64::INFINITY;
        for net in nets {
            let c = table.net_clearance(net);
            if !c.is_finite() || c <= 0.0 {
                return Err(ConfigError::InvalidClearance {
                    name: net.name.clone(),
                    value: c,
                });
            }
            smallest = smallest.min(c);
        }
        self.check_resolution(smallest)
    }

    /// Zone overrides replace a net's clearance inside the zone, so they
    /// bound the resolution the same way.
    pub fn validate_zones(&self, zones: &[Zone]) -> Result<(), ConfigError> {
        let mut smallest = f64::INFINITY;
        for (i, zone) in zones.iter().enumerate() {
            for (d, &c) in &zone.clearance_override {
                if !c.is_finite() || c <= 0.0 {
                    let zone_name = if zone.name.is_empty() {
                        format!("zone #{}", i)
                    } else {
                        zone.name.clone()
                    };
                    return Err(ConfigError::InvalidClearance {
                        name: format!("{} {}", zone_name, d),
                        value: c,
                    });
                }
                smallest = smallest.min(c);
            }
        }
        self.check_resolution(smallest)
    }

    fn check_resolution(&self, smallest: f64) -> Result<(), ConfigError> {
        let resolution = self.space.resolution;
        if smallest.is_finite() && resolution > smallest * (1.0 + 1e-9) {
            return Err(ConfigError::ResolutionTooCoarse {
                resolution,
                clearance: smallest,
            });
        }
        Ok(())
    }
}

fn default_resolution() -> f64 {
    0.1
}

fn default_padding_cells() -> u32 {
    1
}

fn default_max_cells() -> usize {
    50_000_000
}

fn default_connectivity() -> u8 {
    8
}

fn default_turn_penalty() -> f64 {
    1.0
}

fn default_layer_change_cost() -> f64 {
    5.0
}

fn default_shared_corridor_penalty() -> f64 {
    2.0
}

fn default_soft_violation_penalty() -> f64 {
    50.0
}

fn default_speculative_batch() -> usize {
    8
}

fn default_scene_file() -> String {
    "inputs/scene.json".to_string()
}

fn default_report_file() -> String {
    "output/report.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::point::Point;

    #[test]
    fn builtin_compatibility_is_symmetric() {
        let t = DisciplineTable::default();
        assert!(t.compatible(Discipline::CableTray, Discipline::Conduit));
        assert!(t.compatible(Discipline::Conduit, Discipline::CableTray));
        assert!(t.compatible(Discipline::Duct, Discipline::Duct));
        assert!(!t.compatible(Discipline::Duct, Discipline::Pipe));
    }

    #[test]
    fn explicit_pairs_replace_builtin_ones() {
        let cfg = Config {
            compatibility: Some(vec![[Discipline::Duct, Discipline::Pipe]]),
            ..Default::default()
        };
        let t = cfg.discipline_table();
        assert!(t.compatible(Discipline::Pipe, Discipline::Duct));
        assert!(!t.compatible(Discipline::Pipe, Discipline::Sprinkler));
        assert!(t.compatible(Discipline::Sprinkler, Discipline::Sprinkler));
    }

    #[test]
    fn discipline_overrides_apply_by_name() {
        let mut cfg = Config::default();
        cfg.disciplines.insert(
            "conduit".to_string(),
            DisciplineRuleConfig {
                clearance: Some(0.5),
                priority: Some(-1),
            },
        );
        let t = cfg.discipline_table();
        assert_eq!(t.clearance(Discipline::Conduit), 0.5);
        assert_eq!(t.priority(Discipline::Conduit), -1);
        assert_eq!(t.clearance(Discipline::Duct), 0.4);

        cfg.disciplines
            .insert("steam".to_string(), DisciplineRuleConfig::default());
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::UnknownDiscipline("steam".to_string()))
        );
    }

    #[test]
    fn rejects_bad_connectivity_and_penalties() {
        let mut cfg = Config::default();
        cfg.graph.connectivity = 6;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidConnectivity(6)));

        let mut cfg = Config::default();
        cfg.graph.turn_penalty = -1.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTurnPenalty(_))
        ));

        let mut cfg = Config::default();
        cfg.graph.soft_violation_penalty = f64::INFINITY;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidCost { .. })));
    }

    #[test]
    fn resolution_must_not_exceed_smallest_clearance() {
        let mut cfg = Config::default();
        cfg.space.resolution = 0.5;
        let nets = vec![
            NetSpec::new(0, Discipline::Duct, Point::new(0.0, 0.0), Point::new(1.0, 1.0))
                .with_clearance(1.0),
            NetSpec::new(1, Discipline::Pipe, Point::new(0.0, 0.0), Point::new(1.0, 1.0))
                .with_clearance(0.25),
        ];
        assert_eq!(
            cfg.validate_for_nets(&nets),
            Err(ConfigError::ResolutionTooCoarse {
                resolution: 0.5,
                clearance: 0.25
            })
        );
        cfg.space.resolution = 0.25;
        assert!(cfg.validate_for_nets(&nets).is_ok());
    }

    #[test]
    fn zone_overrides_bound_the_resolution() {
        let mut over = BTreeMap::new();
        over.insert(Discipline::Pipe, 0.01);
        let mut zone = Zone {
            name: "riser".to_string(),
            polygon: crate::geom::polygon::Polygon::rect(0.0, 0.0, 1.0, 1.0),
            permitted: crate::db::core::DisciplineSet::ALL,
            clearance_override: over,
            layers: None,
        };
        let mut cfg = Config::default();
        cfg.space.resolution = 1.0;
        assert_eq!(
            cfg.validate_zones(std::slice::from_ref(&zone)),
            Err(ConfigError::ResolutionTooCoarse {
                resolution: 1.0,
                clearance: 0.01
            })
        );

        zone.clearance_override.insert(Discipline::Pipe, f64::NAN);
        assert!(matches!(
            cfg.validate_zones(std::slice::from_ref(&zone)),
            Err(ConfigError::InvalidClearance { ref name, .. }) if name == "riser pipe"
        ));

        zone.clearance_override.insert(Discipline::Pipe, 1.0);
        assert!(cfg.validate_zones(&[zone]).is_ok());
    }
}
