use crate::db::indices::*;
use crate::geom::point::Point;
use crate::geom::polygon::Polygon;
use crate::geom::rect::Rect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// MEP system category. Closed set: every rule table is indexed by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    Duct,
    Pipe,
    Conduit,
    CableTray,
    Sprinkler,
}

impl Discipline {
    pub const COUNT: usize = 5;
    pub const ALL: [Discipline; Discipline::COUNT] = [
        Discipline::Duct,
        Discipline::Pipe,
        Discipline::Conduit,
        Discipline::CableTray,
        Discipline::Sprinkler,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Discipline::Duct => "duct",
            Discipline::Pipe => "pipe",
            Discipline::Conduit => "conduit",
            Discipline::CableTray => "cable_tray",
            Discipline::Sprinkler => "sprinkler",
        }
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Discipline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Discipline::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown discipline '{}'", s))
    }
}

/// Bitset over [`Discipline`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Discipline>", into = "Vec<Discipline>")]
pub struct DisciplineSet(u8);

impl DisciplineSet {
    pub const EMPTY: DisciplineSet = DisciplineSet(0);
    pub const ALL: DisciplineSet = DisciplineSet((1 << Discipline::COUNT) - 1);

    pub fn single(d: Discipline) -> Self {
        Self(1 << d.index())
    }

    #[inline(always)]
    pub fn contains(&self, d: Discipline) -> bool {
        self.0 & (1 << d.index()) != 0
    }

    pub fn insert(&mut self, d: Discipline) {
        self.0 |= 1 << d.index();
    }

    pub fn remove_all(&mut self, other: DisciplineSet) {
        self.0 &= !other.0;
    }

    pub fn intersection(&self, other: DisciplineSet) -> DisciplineSet {
        DisciplineSet(self.0 & other.0)
    }

    pub fn union(&self, other: DisciplineSet) -> DisciplineSet {
        DisciplineSet(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL.0
    }

    pub fn iter(&self) -> impl Iterator<Item = Discipline> + '_ {
        Discipline::ALL.into_iter().filter(|d| self.contains(*d))
    }
}

impl From<Vec<Discipline>> for DisciplineSet {
    fn from(v: Vec<Discipline>) -> Self {
        v.into_iter().collect()
    }
}

impl From<DisciplineSet> for Vec<Discipline> {
    fn from(s: DisciplineSet) -> Self {
        s.iter().collect()
    }
}

impl FromIterator<Discipline> for DisciplineSet {
    fn from_iter<I: IntoIterator<Item = Discipline>>(iter: I) -> Self {
        let mut s = DisciplineSet::EMPTY;
        for d in iter {
            s.insert(d);
        }
        s
    }
}

impl fmt::Debug for DisciplineSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Inclusive layer span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRange {
    pub min: u8,
    pub max: u8,
}

impl LayerRange {
    pub fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, layer: u8) -> bool {
        layer >= self.min && layer <= self.max
    }
}

/// Blocked region. With a non-empty `excluded_disciplines` set the region
/// is closed only to those disciplines; otherwise it blocks every run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Obstacle {
    #[serde(default)]
    pub name: String,
    pub polygon: Polygon,
    #[serde(default)]
    pub layers: Option<LayerRange>,
    #[serde(default)]
    pub excluded_disciplines: DisciplineSet,
}

impl Obstacle {
    pub fn new(polygon: Polygon) -> Self {
        Self {
            name: String::new(),
            polygon,
            layers: None,
            excluded_disciplines: DisciplineSet::EMPTY,
        }
    }

    pub fn on_layer(&self, layer: u8) -> bool {
        self.layers.is_none_or(|r| r.contains(layer))
    }

    pub fn is_full_block(&self) -> bool {
        self.excluded_disciplines.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub name: String,
    pub polygon: Polygon,
    pub permitted: DisciplineSet,
    #[serde(default)]
    pub clearance_override: BTreeMap<Discipline, f64>,
    #[serde(default)]
    pub layers: Option<LayerRange>,
}

impl Zone {
    pub fn on_layer(&self, layer: u8) -> bool {
        self.layers.is_none_or(|r| r.contains(layer))
    }
}

/// Riser or shaft location where runs may change layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferPoint {
    pub point: Point<f64>,
    #[serde(default)]
    pub layers: Option<LayerRange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetRole {
    #[default]
    Source,
    Sink,
}

impl fmt::Display for NetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetRole::Source => f.write_str("source"),
            NetRole::Sink => f.write_str("sink"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Terminal {
    pub point: Point<f64>,
    #[serde(default)]
    pub layer: u8,
    /// Falls back to the owning net's discipline when absent.
    #[serde(default)]
    pub discipline: Option<Discipline>,
    #[serde(default)]
    pub role: NetRole,
}

impl Terminal {
    pub fn new(point: Point<f64>, layer: u8, role: NetRole) -> Self {
        Self {
            point,
            layer,
            discipline: None,
            role,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearanceMode {
    /// Clearance violations are infeasible moves.
    #[default]
    Hard,
    /// Clearance violations cost a finite penalty and are flagged.
    Soft,
}

/// One routing request, as ingested.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetSpec {
    pub id: NetId,
    #[serde(default)]
    pub name: String,
    pub discipline: Discipline,
    pub source: Terminal,
    pub sink: Terminal,
    /// Overrides the discipline's default clearance radius.
    #[serde(default)]
    pub clearance: Option<f64>,
    /// Lower ranks route first within a discipline tier.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mode: ClearanceMode,
}

impl NetSpec {
    pub fn new(id: usize, discipline: Discipline, source: Point<f64>, sink: Point<f64>) -> Self {
        Self {
            id: NetId::new(id),
            name: format!("net{}", id),
            discipline,
            source: Terminal::new(source, 0, NetRole::Source),
            sink: Terminal::new(sink, 0, NetRole::Sink),
            clearance: None,
            priority: 0,
            mode: ClearanceMode::Hard,
        }
    }

    pub fn with_layers(mut self, source_layer: u8, sink_layer: u8) -> Self {
        self.source.layer = source_layer;
        self.sink.layer = sink_layer;
        self
    }

    pub fn with_clearance(mut self, clearance: f64) -> Self {
        self.clearance = Some(clearance);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: ClearanceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn terminal(&self, role: NetRole) -> &Terminal {
        match role {
            NetRole::Source => &self.source,
            NetRole::Sink => &self.sink,
        }
    }
}

/// A complete routing batch handed over by the geometry extraction stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Scene {
    /// Declared drawing unit. Carried through untouched; no conversion happens.
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
    /// Routing area. Derived from the input geometry when absent.
    #[serde(default)]
    pub extent: Option<Rect>,
    #[serde(default = "default_layers")]
    pub layers: u8,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub transfers: Vec<TransferPoint>,
    #[serde(default)]
    pub nets: Vec<NetSpec>,
}

fn default_layers() -> u8 {
    1
}

impl Scene {
    pub fn new(extent: Rect) -> Self {
        Self {
            extent: Some(extent),
            layers: 1,
            ..Default::default()
        }
    }

    pub fn num_nets(&self) -> usize {
        self.nets.len()
    }

    /// Bounding box of every geometric input, terminals included.
    pub fn geometry_bounds(&self) -> Option<Rect> {
        let polys = self
            .obstacles
            .iter()
            .map(|o| o.polygon.bounds())
            .chain(self.zones.iter().map(|z| z.polygon.bounds()));
        let points = self
            .nets
            .iter()
            .flat_map(|n| [n.source.point, n.sink.point])
            .chain(self.transfers.iter().map(|t| t.point))
            .map(|p| Rect::new(p, p));
        polys.chain(points).reduce(|a, b| a.union(&b))
    }
}
