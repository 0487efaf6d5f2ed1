use crate::db::core::{
    ClearanceMode, Discipline, DisciplineSet, LayerRange, NetSpec, Obstacle, Scene, TransferPoint,
    Zone,
};
use crate::geom::point::Point;
use crate::geom::polygon::Polygon;
use crate::geom::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;

#[derive(Debug, Clone)]
pub struct SceneParams {
    pub size: f64,
    pub obstacles: usize,
    pub nets: usize,
    pub layers: u8,
    pub seed: u64,
}

impl Default for SceneParams {
    fn default() -> Self {
        Self {
            size: 40.0,
            obstacles: 30,
            nets: 20,
            layers: 1,
            seed: 1,
        }
    }
}

/// Square floor with rectangular equipment, one restricted plant room and
/// terminals placed in open floor. Identical params give identical scenes.
pub fn random_scene(params: &SceneParams) -> Scene {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let size = params.size.max(4.0);
    let layers = params.layers.max(1);
    let mut scene = Scene::new(Rect::new(Point::new(0.0, 0.0), Point::new(size, size)));
    scene.unit = Some("m".to_string());
    scene.layers = layers;

    let max_side = (size / 8.0).max(1.0);
    for i in 0..params.obstacles {
        let w = rng.gen_range(0.5..max_side);
        let h = rng.gen_range(0.5..max_side);
        let x = rng.gen_range(0.0..(size - w));
        let y = rng.gen_range(0.0..(size - h));
        let mut o = Obstacle::new(Polygon::rect(x, y, x + w, y + h));
        o.name = format!("equipment{}", i);
        if layers > 1 && rng.gen_bool(0.3) {
            let z = rng.gen_range(0..layers);
            o.layers = Some(LayerRange::new(z, z));
        }
        scene.obstacles.push(o);
    }

    let plant = size * 0.2;
    let mut clearance_override = BTreeMap::new();
    clearance_override.insert(Discipline::Pipe, 0.1);
    scene.zones.push(Zone {
        name: "plant_room".to_string(),
        polygon: Polygon::rect(size - plant, size - plant, size, size),
        permitted: [Discipline::Pipe, Discipline::Duct].into_iter().collect::<DisciplineSet>(),
        clearance_override,
        layers: None,
    });

    if layers > 1 {
        for k in 0..=2 {
            let t = size * (0.25 + 0.25 * k as f64);
            scene.transfers.push(TransferPoint {
                point: Point::new(t, size * 0.5),
                layers: None,
            });
        }
    }

    let free = |scene: &Scene, p: Point<f64>, z: u8, d: Discipline| {
        let clear_of_equipment = scene
            .obstacles
            .iter()
            .filter(|o| o.on_layer(z))
            .all(|o| !o.polygon.bounds().expand(0.5).contains(p));
        let zone_allows = scene
            .zones
            .iter()
            .all(|zone| zone.permitted.contains(d) || !zone.polygon.bounds().expand(0.5).contains(p));
        clear_of_equipment && zone_allows
    };

    let mut placed = 0;
    let mut attempts = 0;
    while placed < params.nets && attempts < params.nets * 50 {
        attempts += 1;
        let discipline = Discipline::ALL[rng.gen_range(0..Discipline::COUNT)];
        let a = Point::new(rng.gen_range(0.5..size - 0.5), rng.gen_range(0.5..size - 0.5));
        let b = Point::new(rng.gen_range(0.5..size - 0.5), rng.gen_range(0.5..size - 0.5));
        let za = rng.gen_range(0..layers);
        let zb = rng.gen_range(0..layers);
        if !free(&scene, a, za, discipline) || !free(&scene, b, zb, discipline) {
            continue;
        }
        let mode = if rng.gen_bool(0.2) {
            ClearanceMode::Soft
        } else {
            ClearanceMode::Hard
        };
        let net = NetSpec::new(placed, discipline, a, b)
            .with_layers(za, zb)
            .with_priority(rng.gen_range(0..3))
            .with_mode(mode);
        scene.nets.push(net);
        placed += 1;
    }

    log::info!(
        "Generated scene: {} obstacles, {} nets, {} layers, {:.0}x{:.0}",
        scene.obstacles.len(),
        scene.nets.len(),
        layers,
        size,
        size
    );
    scene
}

pub fn write_scene(filename: &str, scene: &Scene) -> std::io::Result<()> {
    let file = BufWriter::new(File::create(filename)?);
    serde_json::to_writer_pretty(file, scene).map_err(std::io::Error::other)
}
