use crate::db::core::Discipline;
use image::{ImageResult, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect as ImageRect;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Paint {
    Free,
    Obstacle,
    Restricted,
    Reserved(Discipline),
}

/// One layer of the occupancy grid, row-major from the bottom row up.
pub struct PaintGrid {
    pub width: u32,
    pub height: u32,
    pub cells: Vec<Paint>,
}

/// A routed run in cell coordinates (cell centres at integer positions).
pub struct PaintRoute {
    pub discipline: Discipline,
    pub points: Vec<(f64, f64)>,
    pub violation: bool,
}

fn discipline_color(d: Discipline, alpha: u8) -> Rgba<u8> {
    match d {
        Discipline::Duct => Rgba([0, 110, 255, alpha]),
        Discipline::Pipe => Rgba([0, 255, 100, alpha]),
        Discipline::Conduit => Rgba([255, 215, 0, alpha]),
        Discipline::CableTray => Rgba([180, 50, 255, alpha]),
        Discipline::Sprinkler => Rgba([255, 20, 80, alpha]),
    }
}

pub fn draw_layer(
    grid: &PaintGrid,
    routes: &[PaintRoute],
    filename: impl AsRef<Path>,
    px_per_cell: u32,
) -> ImageResult<()> {
    let px = px_per_cell.max(1);
    let w = grid.width * px;
    let h = grid.height * px;
    let mut img = RgbaImage::from_pixel(w.max(1), h.max(1), Rgba([20, 20, 20, 255]));

    // Image rows grow downwards, grid rows grow upwards.
    let to_px = |x: f64, y: f64| {
        (
            ((x + 0.5) * px as f64) as f32,
            (h as f64 - (y + 0.5) * px as f64) as f32,
        )
    };

    for (i, paint) in grid.cells.iter().enumerate() {
        let color = match paint {
            Paint::Free => continue,
            Paint::Obstacle => Rgba([120, 120, 125, 255]),
            Paint::Restricted => Rgba([60, 45, 30, 255]),
            Paint::Reserved(d) => discipline_color(*d, 70),
        };
        let cx = i as u32 % grid.width;
        let cy = i as u32 / grid.width;
        let top = h - (cy + 1) * px;
        let rect = ImageRect::at((cx * px) as i32, top as i32).of_size(px, px);
        draw_filled_rect_mut(&mut img, rect, color);
    }

    for route in routes {
        let color = if route.violation {
            Rgba([255, 255, 255, 255])
        } else {
            discipline_color(route.discipline, 255)
        };
        for pair in route.points.windows(2) {
            let a = to_px(pair[0].0, pair[0].1);
            let b = to_px(pair[1].0, pair[1].1);
            draw_line_segment_mut(&mut img, a, b, color);
            if px >= 4 {
                draw_line_segment_mut(&mut img, (a.0 + 1.0, a.1), (b.0 + 1.0, b.1), color);
            }
        }
        if let (Some(first), Some(last)) = (route.points.first(), route.points.last()) {
            for p in [first, last] {
                let (x, y) = to_px(p.0, p.1);
                let s = (px / 2).max(2);
                let rect = ImageRect::at(x as i32 - s as i32 / 2, y as i32 - s as i32 / 2)
                    .of_size(s, s);
                draw_filled_rect_mut(&mut img, rect, Rgba([255, 255, 255, 255]));
            }
        }
    }

    img.save(filename)
}
