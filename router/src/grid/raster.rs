//! Obstacle and zone rasterization plus the obstacle distance field.

use super::dense::{Cell, Occupancy};
use crate::utils::conversion::GridConverter;
use mep_common::db::core::{Obstacle, Zone};
use mep_common::db::indices::ZoneId;
use mep_common::geom::polygon::Polygon;
use mep_common::geom::rect::Rect;
use mep_common::geom::rtree::SpatialIndex;
use mep_common::util::config::RasterMode;
use rayon::prelude::*;

fn covers(polygon: &Polygon, cell: &Rect, mode: RasterMode) -> bool {
    match mode {
        RasterMode::Conservative => polygon.overlaps_cell(cell),
        RasterMode::Center => polygon.contains(cell.center()),
    }
}

/// Stamps obstacles and zones into `cells`, one row per rayon task.
///
/// Obstacles apply in id order, then zones. A zone narrows the permitted
/// set of every cell whose centre it contains; the highest zone id wins the
/// cell's zone tag.
pub fn rasterize(
    cells: &mut [Cell],
    converter: &GridConverter,
    layers: u8,
    obstacles: &[Obstacle],
    zones: &[Zone],
    mode: RasterMode,
) {
    let obstacle_index = SpatialIndex::bulk_load(
        obstacles
            .iter()
            .enumerate()
            .map(|(i, o)| (o.polygon.bounds(), i)),
    );
    let zone_index =
        SpatialIndex::bulk_load(zones.iter().enumerate().map(|(i, z)| (z.polygon.bounds(), i)));

    let w = converter.width() as usize;
    let plane = w * converter.height() as usize;

    for z in 0..layers {
        let start = z as usize * plane;
        let layer_cells = &mut cells[start..start + plane];
        layer_cells
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| {
                let row_rect = converter.row_rect(y as u32);
                let blocking: Vec<&Obstacle> = obstacle_index
                    .query(row_rect)
                    .into_iter()
                    .map(|i| &obstacles[i])
                    .filter(|o| o.on_layer(z))
                    .collect();
                let covering: Vec<(usize, &Zone)> = zone_index
                    .query(row_rect)
                    .into_iter()
                    .map(|i| (i, &zones[i]))
                    .filter(|(_, zone)| zone.on_layer(z))
                    .collect();
                if blocking.is_empty() && covering.is_empty() {
                    return;
                }

                for (x, cell) in row.iter_mut().enumerate() {
                    let rect = converter.cell_rect(x as u32, y as u32);
                    for o in &blocking {
                        if covers(&o.polygon, &rect, mode) {
                            if o.is_full_block() {
                                cell.occupancy = Occupancy::Obstacle;
                            } else {
                                cell.permitted.remove_all(o.excluded_disciplines);
                            }
                        }
                    }
                    let centre = rect.center();
                    for (id, zone) in &covering {
                        if zone.polygon.contains(centre) {
                            cell.permitted = cell.permitted.intersection(zone.permitted);
                            cell.zone = Some(ZoneId::new(*id));
                        }
                    }
                }
            });
    }
}

/// Exact Euclidean distance from every cell centre to the nearest obstacle
/// cell centre on the same layer, in world units. Layers without obstacles
/// read as infinity.
pub fn obstacle_distance(
    cells: &[Cell],
    width: u32,
    height: u32,
    layers: u8,
    resolution: f64,
) -> Vec<f32> {
    let w = width as usize;
    let h = height as usize;
    let plane = w * h;
    // Larger than any squared in-grid distance, small enough to stay exact.
    let far = ((w + h) * (w + h)) as f64 * 2.0 + 1.0;
    let mut out = vec![f32::INFINITY; cells.len()];

    for z in 0..layers as usize {
        let layer = &cells[z * plane..(z + 1) * plane];
        if !layer.iter().any(|c| c.occupancy == Occupancy::Obstacle) {
            continue;
        }
        let mut sq: Vec<f64> = layer
            .iter()
            .map(|c| if c.occupancy == Occupancy::Obstacle { 0.0 } else { far })
            .collect();

        sq.par_chunks_mut(w).for_each(squared_distance_1d);

        let columns: Vec<Vec<f64>> = (0..w)
            .into_par_iter()
            .map(|x| {
                let mut col: Vec<f64> = (0..h).map(|y| sq[y * w + x]).collect();
                squared_distance_1d(&mut col);
                col
            })
            .collect();

        let dst = &mut out[z * plane..(z + 1) * plane];
        for (x, col) in columns.iter().enumerate() {
            for (y, d2) in col.iter().enumerate() {
                dst[y * w + x] = if *d2 >= far {
                    f32::INFINITY
                } else {
                    (d2.sqrt() * resolution) as f32
                };
            }
        }
    }
    out
}

/// Lower envelope of parabolas rooted at each sample (Felzenszwalb and
/// Huttenlocher). Replaces `f` with `min_q (p - q)^2 + f[q]`.
fn squared_distance_1d(f: &mut [f64]) {
    let n = f.len();
    if n < 2 {
        return;
    }
    let src = f.to_vec();
    let mut v = vec![0usize; n];
    let mut bounds = vec![0f64; n + 1];
    let mut k = 0usize;
    bounds[0] = f64::NEG_INFINITY;
    bounds[1] = f64::INFINITY;

    let intersect = |q: usize, p: usize| {
        let (qf, pf) = (q as f64, p as f64);
        ((src[q] + qf * qf) - (src[p] + pf * pf)) / (2.0 * (qf - pf))
    };

    for q in 1..n {
        let mut s = intersect(q, v[k]);
        while s <= bounds[k] {
            k -= 1;
            s = intersect(q, v[k]);
        }
        k += 1;
        v[k] = q;
        bounds[k] = s;
        bounds[k + 1] = f64::INFINITY;
    }

    k = 0;
    for (q, out) in f.iter_mut().enumerate() {
        while bounds[k + 1] < q as f64 {
            k += 1;
        }
        let d = q as f64 - v[k] as f64;
        *out = d * d + src[v[k]];
    }
}
