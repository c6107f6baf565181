use crate::config::AppConfig;
use crate::data;
use anyhow::{Context, Result, anyhow};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::{Coord, MultiPolygon, Rect};
use image::{Rgba, RgbaImage};
use rand::seq::SliceRandom;

const CANVAS_WIDTH: u32 = 1600;
const MARGIN: u32 = 20;
const TREE_SAMPLE: usize = 2000;

const OUTLINE: Rgba<u8> = Rgba([30, 30, 30, 255]);
const SCHOOL: Rgba<u8> = Rgba([214, 39, 40, 255]);
const TREE: Rgba<u8> = Rgba([44, 160, 44, 255]);

// lon/lat -> canvas pixels, y flipped
struct Frame {
    bounds: Rect<f64>,
    scale: f64,
    height: u32,
}

impl Frame {
    fn fit(bounds: Rect<f64>) -> Frame {
        let usable = (CANVAS_WIDTH - 2 * MARGIN) as f64;
        let scale = usable / bounds.width().max(f64::EPSILON);
        let height = (bounds.height() * scale).ceil() as u32 + 2 * MARGIN;
        Frame {
            bounds,
            scale,
            height,
        }
    }

    fn to_pixel(&self, coord: Coord<f64>) -> (i64, i64) {
        let x = (coord.x - self.bounds.min().x) * self.scale + MARGIN as f64;
        let y = (self.bounds.max().y - coord.y) * self.scale + MARGIN as f64;
        (x as i64, y as i64)
    }
}

/// Render a quick overview of the processed layers for eyeballing: ward
/// outlines, schools, and a random sample of trees.
pub fn render(config: &AppConfig) -> Result<()> {
    let processed = &config.output.processed_dir;

    let wards = data::load_ward_boundaries(&processed.join("wards.geojson"))
        .context("QC plot needs the processed wards (run preprocess first)")?;
    if wards.is_empty() {
        return Err(anyhow!("No ward boundaries to plot"));
    }
    let schools = data::load_point_features(&processed.join("schools.geojson"))?;
    let trees = data::load_point_features(&processed.join("trees.geojson"))?;

    let bounds = wards
        .iter()
        .filter_map(|(_, geometry)| geometry.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                Coord {
                    x: a.min().x.min(b.min().x),
                    y: a.min().y.min(b.min().y),
                },
                Coord {
                    x: a.max().x.max(b.max().x),
                    y: a.max().y.max(b.max().y),
                },
            )
        })
        .ok_or_else(|| anyhow!("Ward boundaries have no extent"))?;

    let frame = Frame::fit(bounds);
    let mut img = RgbaImage::from_pixel(CANVAS_WIDTH, frame.height, Rgba([255, 255, 255, 255]));

    for (_, geometry) in &wards {
        draw_outline(&mut img, &frame, geometry);
    }

    let mut rng = rand::thread_rng();
    let sampled: Vec<_> = trees.choose_multiple(&mut rng, TREE_SAMPLE).collect();
    for (_, point) in &sampled {
        put_pixel_checked(&mut img, frame.to_pixel(point.0), TREE);
    }

    for (_, point) in &schools {
        let (px, py) = frame.to_pixel(point.0);
        for dy in -1..=1 {
            for dx in -1..=1 {
                put_pixel_checked(&mut img, (px + dx, py + dy), SCHOOL);
            }
        }
    }

    let out_path = processed.join("qc_plot.png");
    img.save(&out_path)
        .with_context(|| format!("Failed to save QC plot: {:?}", out_path))?;
    println!(
        "QC plot: {} wards, {} schools, {} of {} trees -> {:?}",
        wards.len(),
        schools.len(),
        sampled.len(),
        trees.len(),
        out_path
    );
    Ok(())
}

fn draw_outline(img: &mut RgbaImage, frame: &Frame, geometry: &MultiPolygon<f64>) {
    for polygon in geometry {
        let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors().iter());
        for ring in rings {
            for segment in ring.0.windows(2) {
                draw_line(img, frame.to_pixel(segment[0]), frame.to_pixel(segment[1]));
            }
        }
    }
}

fn draw_line(img: &mut RgbaImage, (x0, y0): (i64, i64), (x1, y1): (i64, i64)) {
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1);
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = x0 as f64 + (x1 - x0) as f64 * t;
        let y = y0 as f64 + (y1 - y0) as f64 * t;
        put_pixel_checked(img, (x.round() as i64, y.round() as i64), OUTLINE);
    }
}

fn put_pixel_checked(img: &mut RgbaImage, (x, y): (i64, i64), color: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}
