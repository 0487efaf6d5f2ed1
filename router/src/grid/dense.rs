use super::SpaceQuery;
use super::raster;
use crate::utils::conversion::GridConverter;
use mep_common::db::core::{Discipline, DisciplineSet, Obstacle, Scene, TransferPoint, Zone};
use mep_common::db::indices::{NetId, ZoneId};
use mep_common::db::parser::scene::{self as scene_parser, IngestReport};
use mep_common::error::GeometryError;
use mep_common::geom::coord::GridCoord;
use mep_common::geom::point::Point;
use mep_common::geom::polygon::segment_distance;
use mep_common::geom::rect::Rect;
use mep_common::util::config::{RasterMode, SpaceConfig};
use mep_common::util::visualization::{Paint, PaintGrid};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

const CORRIDOR_EPS: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Occupancy {
    #[default]
    Free,
    Obstacle,
    Reserved {
        net: NetId,
        discipline: Discipline,
    },
}

/// What a cell looks like to a caller that does not care about distances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellClass {
    Free,
    Obstacle,
    /// Open, but only to the listed disciplines.
    Restricted(DisciplineSet),
    Reserved {
        net: NetId,
        discipline: Discipline,
    },
}

// 8 bytes of payload besides the tag; the distance field lives in its own
// vector so the search touches less memory per cell.
#[derive(Clone, Copy, Debug)]
pub struct Cell {
    pub occupancy: Occupancy,
    pub permitted: DisciplineSet,
    pub zone: Option<ZoneId>,
    pub transfer: bool,
    pub epoch: u32,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            occupancy: Occupancy::Free,
            permitted: DisciplineSet::ALL,
            zone: None,
            transfer: false,
            epoch: 0,
        }
    }
}

/// Result of [`SpaceModel::commit_corridor`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Cells held by the net after the commit.
    pub reserved: usize,
    /// Cells of the net's previous corridor that were freed first.
    pub released: usize,
    /// Corridor cells left to the net that already held them.
    pub contested: usize,
}

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub resolution: f64,
    /// Routing area; derived from the geometry plus padding when `None`.
    pub extent: Option<Rect>,
    pub layers: u8,
    pub raster_mode: RasterMode,
    pub padding_cells: u32,
    pub max_cells: usize,
}

impl BuildOptions {
    pub fn new(resolution: f64) -> Self {
        let defaults = SpaceConfig::default();
        Self {
            resolution,
            extent: None,
            layers: 1,
            raster_mode: defaults.raster_mode,
            padding_cells: defaults.padding_cells,
            max_cells: defaults.max_cells,
        }
    }

    pub fn from_config(config: &SpaceConfig, scene: &Scene) -> Self {
        Self {
            resolution: config.resolution,
            extent: scene.extent,
            layers: if config.layers > 0 {
                config.layers
            } else {
                scene.layers.max(1)
            },
            raster_mode: config.raster_mode,
            padding_cells: config.padding_cells,
            max_cells: config.max_cells,
        }
    }
}

/// Layered occupancy grid. Static geometry is fixed at build time; the only
/// mutation afterwards is corridor reservation, which never frees obstacle
/// cells or cells held by another net.
#[derive(Clone)]
pub struct SpaceModel {
    converter: GridConverter,
    width: u32,
    height: u32,
    layers: u8,
    cells: Vec<Cell>,
    obstacle_dist: Vec<f32>,
    zone_overrides: Vec<BTreeMap<Discipline, f64>>,
    reservations: BTreeMap<NetId, Vec<u32>>,
    epoch: u32,
}

impl SpaceModel {
    /// Single-layer model over the padded bounds of the geometry.
    pub fn build(obstacles: &[Obstacle], zones: &[Zone], resolution: f64) -> Result<Self, GeometryError> {
        Self::build_with(obstacles, zones, &[], &[], &BuildOptions::new(resolution))
    }

    /// Validates the scene under the configured ingest policy and builds its grid.
    pub fn from_scene(scene: &Scene, config: &SpaceConfig) -> Result<(Self, IngestReport), GeometryError> {
        let mut accepted = scene.clone();
        let report = scene_parser::validate(&mut accepted, config.ingest_policy)?;
        let anchors: Vec<Point<f64>> = accepted
            .nets
            .iter()
            .flat_map(|n| [n.source.point, n.sink.point])
            .collect();
        let options = BuildOptions::from_config(config, &accepted);
        let model = Self::build_with(
            &accepted.obstacles,
            &accepted.zones,
            &accepted.transfers,
            &anchors,
            &options,
        )?;
        Ok((model, report))
    }

    /// `anchors` only widen a derived extent; they are not rasterized.
    pub fn build_with(
        obstacles: &[Obstacle],
        zones: &[Zone],
        transfers: &[TransferPoint],
        anchors: &[Point<f64>],
        options: &BuildOptions,
    ) -> Result<Self, GeometryError> {
        let res = options.resolution;
        if !res.is_finite() || res <= 0.0 {
            return Err(GeometryError::NonPositiveResolution(res));
        }

        let bad_obstacle = obstacles.par_iter().enumerate().find_map_first(|(i, o)| {
            o.polygon
                .validate()
                .err()
                .map(|d| GeometryError::from_defect(label("obstacle", i, &o.name), d))
        });
        if let Some(e) = bad_obstacle {
            return Err(e);
        }
        let bad_zone = zones.par_iter().enumerate().find_map_first(|(i, z)| {
            z.polygon
                .validate()
                .err()
                .map(|d| GeometryError::from_defect(label("zone", i, &z.name), d))
        });
        if let Some(e) = bad_zone {
            return Err(e);
        }

        let extent = match options.extent {
            Some(extent) => extent,
            None => derived_extent(obstacles, zones, transfers, anchors)
                .ok_or(GeometryError::EmptyExtent)?
                .expand(options.padding_cells as f64 * res),
        };
        let finite = extent.min.is_finite() && extent.max.is_finite();
        if !finite || extent.width() <= 0.0 || extent.height() <= 0.0 {
            return Err(GeometryError::EmptyExtent);
        }

        let layers = options.layers.max(1);
        let planar_w = (extent.width() / res).ceil();
        let planar_h = (extent.height() / res).ceil();
        let total = planar_w * planar_h * layers as f64;
        if total > options.max_cells as f64 || planar_w > u32::MAX as f64 || planar_h > u32::MAX as f64 {
            return Err(GeometryError::GridTooLarge {
                cells: total.min(usize::MAX as f64) as usize,
                limit: options.max_cells,
            });
        }

        let converter = GridConverter::for_extent(&extent, res);
        let (width, height) = (converter.width(), converter.height());
        let mut cells = vec![Cell::default(); width as usize * height as usize * layers as usize];

        raster::rasterize(&mut cells, &converter, layers, obstacles, zones, options.raster_mode);

        let mut model = Self {
            converter,
            width,
            height,
            layers,
            cells,
            obstacle_dist: Vec::new(),
            zone_overrides: zones.iter().map(|z| z.clearance_override.clone()).collect(),
            reservations: BTreeMap::new(),
            epoch: 0,
        };

        for t in transfers {
            for z in 0..layers {
                if t.layers.is_some_and(|r| !r.contains(z)) {
                    continue;
                }
                if let Some(c) = model.converter.to_grid(t.point, z) {
                    let idx = model.index(c);
                    model.cells[idx].transfer = true;
                }
            }
        }

        model.obstacle_dist = raster::obstacle_distance(&model.cells, width, height, layers, res);

        let blocked = model
            .cells
            .iter()
            .filter(|c| c.occupancy == Occupancy::Obstacle)
            .count();
        log::info!(
            "Space model: {}x{}x{} cells at resolution {} ({} blocked)",
            width,
            height,
            layers,
            res,
            blocked
        );
        Ok(model)
    }

    pub fn converter(&self) -> &GridConverter {
        &self.converter
    }

    pub fn cell_of(&self, p: Point<f64>, layer: u8) -> Option<GridCoord> {
        if layer >= self.layers {
            return None;
        }
        self.converter.to_grid(p, layer)
    }

    pub fn center_of(&self, c: GridCoord) -> Point<f64> {
        self.converter.to_world(c)
    }

    pub fn cell(&self, c: GridCoord) -> Option<&Cell> {
        self.in_bounds(c).then(|| &self.cells[self.index(c)])
    }

    pub fn classify(&self, c: GridCoord) -> CellClass {
        let Some(cell) = self.cell(c) else {
            return CellClass::Obstacle;
        };
        match cell.occupancy {
            Occupancy::Obstacle => CellClass::Obstacle,
            Occupancy::Reserved { net, discipline } => CellClass::Reserved { net, discipline },
            Occupancy::Free if cell.permitted.is_all() => CellClass::Free,
            Occupancy::Free => CellClass::Restricted(cell.permitted),
        }
    }

    /// Number of reservation changes applied so far.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn reserved_cells(&self, net: NetId) -> Vec<GridCoord> {
        self.reservations
            .get(&net)
            .map(|v| v.iter().map(|&i| self.coord(i as usize)).collect())
            .unwrap_or_default()
    }

    pub fn total_reserved(&self) -> usize {
        self.reservations.values().map(Vec::len).sum()
    }

    /// Corridor radius at `c`: the zone override when one applies.
    pub fn corridor_radius(&self, c: GridCoord, discipline: Discipline, radius: f64) -> f64 {
        self.clearance_override(c, discipline).unwrap_or(radius)
    }

    /// Reserves every cell whose centre lies within the effective radius of
    /// the polyline through `nodes`, replacing any earlier corridor of `net`.
    ///
    /// Layer changes stamp a disc on both layers. Obstacle cells and cells
    /// held by other nets are left alone, so committing never lowers the
    /// cost of any path for another net.
    pub fn commit_corridor(
        &mut self,
        nodes: &[GridCoord],
        discipline: Discipline,
        radius: f64,
        net: NetId,
    ) -> CommitSummary {
        self.epoch += 1;
        let epoch = self.epoch;
        let released = self.release_with_epoch(net, epoch);

        let mut stamp = Stamp {
            net,
            discipline,
            epoch,
            taken: Vec::new(),
            contested: 0,
        };

        if let [only] = nodes {
            let r = self.corridor_radius(*only, discipline, radius);
            let p = self.center_of(*only);
            self.stamp_segment(p, p, only.z, r, &mut stamp);
        }
        for pair in nodes.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let r = self
                .corridor_radius(a, discipline, radius)
                .max(self.corridor_radius(b, discipline, radius));
            let (pa, pb) = (self.center_of(a), self.center_of(b));
            if a.z == b.z {
                self.stamp_segment(pa, pb, a.z, r, &mut stamp);
            } else {
                self.stamp_segment(pa, pa, a.z, r, &mut stamp);
                self.stamp_segment(pb, pb, b.z, r, &mut stamp);
            }
        }

        let summary = CommitSummary {
            reserved: stamp.taken.len(),
            released,
            contested: stamp.contested,
        };
        log::debug!(
            "Net {} corridor: {} cells reserved, {} released, {} contested",
            net,
            summary.reserved,
            summary.released,
            summary.contested
        );
        if !stamp.taken.is_empty() {
            self.reservations.insert(net, stamp.taken);
        }
        summary
    }

    /// Frees the corridor of `net`. Returns the number of cells released.
    pub fn release(&mut self, net: NetId) -> usize {
        if !self.reservations.contains_key(&net) {
            return 0;
        }
        self.epoch += 1;
        self.release_with_epoch(net, self.epoch)
    }

    fn release_with_epoch(&mut self, net: NetId, epoch: u32) -> usize {
        let Some(held) = self.reservations.remove(&net) else {
            return 0;
        };
        for &i in &held {
            let cell = &mut self.cells[i as usize];
            if matches!(cell.occupancy, Occupancy::Reserved { net: owner, .. } if owner == net) {
                cell.occupancy = Occupancy::Free;
                cell.epoch = epoch;
            }
        }
        held.len()
    }

    fn stamp_segment(&mut self, a: Point<f64>, b: Point<f64>, z: u8, r: f64, stamp: &mut Stamp) {
        let bbox = Rect::new(
            Point::new(a.x.min(b.x), a.y.min(b.y)),
            Point::new(a.x.max(b.x), a.y.max(b.y)),
        )
        .expand(r);
        let Some(((x0, x1), (y0, y1))) = self.converter.cell_span(&bbox) else {
            return;
        };
        for y in y0..=y1 {
            for x in x0..=x1 {
                let c = GridCoord::new(x, y, z);
                if segment_distance(self.center_of(c), a, b) > r + CORRIDOR_EPS {
                    continue;
                }
                let idx = self.index(c);
                let cell = &mut self.cells[idx];
                match cell.occupancy {
                    Occupancy::Obstacle => {}
                    Occupancy::Reserved { net, .. } if net == stamp.net => {}
                    Occupancy::Reserved { .. } => stamp.contested += 1,
                    Occupancy::Free => {
                        cell.occupancy = Occupancy::Reserved {
                            net: stamp.net,
                            discipline: stamp.discipline,
                        };
                        cell.epoch = stamp.epoch;
                        stamp.taken.push(idx as u32);
                    }
                }
            }
        }
    }

    pub fn paint_layer(&self, z: u8) -> PaintGrid {
        let plane = self.width as usize * self.height as usize;
        let start = z.min(self.layers - 1) as usize * plane;
        let cells = self.cells[start..start + plane]
            .iter()
            .map(|c| match c.occupancy {
                Occupancy::Obstacle => Paint::Obstacle,
                Occupancy::Reserved { discipline, .. } => Paint::Reserved(discipline),
                Occupancy::Free if c.permitted.is_all() => Paint::Free,
                Occupancy::Free => Paint::Restricted,
            })
            .collect();
        PaintGrid {
            width: self.width,
            height: self.height,
            cells,
        }
    }
}

struct Stamp {
    net: NetId,
    discipline: Discipline,
    epoch: u32,
    taken: Vec<u32>,
    contested: usize,
}

fn label(kind: &str, index: usize, name: &str) -> String {
    if name.is_empty() {
        format!("{} #{}", kind, index)
    } else {
        format!("{} '{}'", kind, name)
    }
}

fn derived_extent(
    obstacles: &[Obstacle],
    zones: &[Zone],
    transfers: &[TransferPoint],
    anchors: &[Point<f64>],
) -> Option<Rect> {
    obstacles
        .iter()
        .map(|o| o.polygon.bounds())
        .chain(zones.iter().map(|z| z.polygon.bounds()))
        .chain(transfers.iter().map(|t| Rect::new(t.point, t.point)))
        .chain(anchors.iter().map(|p| Rect::new(*p, *p)))
        .reduce(|a, b| a.union(&b))
}

impl SpaceQuery for SpaceModel {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn layers(&self) -> u8 {
        self.layers
    }
    fn resolution(&self) -> f64 {
        self.converter.resolution()
    }

    fn occupancy(&self, c: GridCoord) -> Occupancy {
        if !self.in_bounds(c) {
            return Occupancy::Obstacle;
        }
        self.cells[self.index(c)].occupancy
    }

    fn permitted(&self, c: GridCoord) -> DisciplineSet {
        if !self.in_bounds(c) {
            return DisciplineSet::EMPTY;
        }
        self.cells[self.index(c)].permitted
    }

    fn obstacle_distance(&self, c: GridCoord) -> f64 {
        if !self.in_bounds(c) {
            return 0.0;
        }
        self.obstacle_dist[self.index(c)] as f64
    }

    fn is_transfer(&self, c: GridCoord) -> bool {
        self.in_bounds(c) && self.cells[self.index(c)].transfer
    }

    fn clearance_override(&self, c: GridCoord, d: Discipline) -> Option<f64> {
        let zone = self.cell(c)?.zone?;
        self.zone_overrides.get(zone.index())?.get(&d).copied()
    }

    fn cell_epoch(&self, c: GridCoord) -> u32 {
        self.cell(c).map_or(0, |cell| cell.epoch)
    }

    fn center(&self, c: GridCoord) -> Point<f64> {
        self.converter.to_world(c)
    }
}
