use anyhow::{Context, Result, anyhow};
use geo::MultiPolygon;
use geo::Point;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

/// Affine pixel <-> model-space mapping from the GeoTIFF
/// ModelPixelScale/ModelTiepoint tags. Axis-aligned rasters only (no
/// rotation terms), which is what the merged DEM export produces.
#[derive(Debug, Clone)]
struct GeoTransform {
    origin_x: f64,
    origin_y: f64,
    pixel_width: f64,
    pixel_height: f64, // negative: row 0 is the northern edge
}

impl GeoTransform {
    fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y + row * self.pixel_height,
        )
    }

    fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }
}

/// A DEM raster held fully in memory, in the same CRS as the ward
/// geometries (EPSG:4326).
pub struct DemRaster {
    width: usize,
    height: usize,
    transform: GeoTransform,
    nodata: Option<f64>,
    data: Vec<f32>,
}

impl DemRaster {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open DEM file: {:?}", path))?;
        let mut decoder = Decoder::new(BufReader::new(file))
            .with_context(|| format!("Failed to decode TIFF: {:?}", path))?;

        let (width, height) = decoder.dimensions().context("DEM has no dimensions")?;

        let scale = decoder
            .get_tag_f64_vec(Tag::ModelPixelScaleTag)
            .context("DEM is missing the ModelPixelScale tag (not a georeferenced GeoTIFF?)")?;
        let tiepoint = decoder
            .get_tag_f64_vec(Tag::ModelTiepointTag)
            .context("DEM is missing the ModelTiepoint tag")?;
        if scale.len() < 2 || tiepoint.len() < 6 {
            return Err(anyhow!("Malformed GeoTIFF georeferencing tags"));
        }
        // tiepoint pins raster (i, j) to model (x, y); back out the raster origin
        let transform = GeoTransform {
            origin_x: tiepoint[3] - tiepoint[0] * scale[0],
            origin_y: tiepoint[4] + tiepoint[1] * scale[1],
            pixel_width: scale[0],
            pixel_height: -scale[1],
        };

        let nodata = decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

        let data = match decoder.read_image().context("Failed to read DEM raster")? {
            DecodingResult::F32(v) => v,
            DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
            _ => return Err(anyhow!("Unsupported DEM sample format")),
        };

        let (width, height) = (width as usize, height as usize);
        if data.len() < width * height {
            return Err(anyhow!(
                "DEM raster is truncated: {} samples for {}x{}",
                data.len(),
                width,
                height
            ));
        }

        Ok(DemRaster {
            width,
            height,
            transform,
            nodata,
            data,
        })
    }

    fn is_nodata(&self, value: f32) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.nodata {
            Some(nd) => (value as f64 - nd).abs() < 1e-6,
            None => false,
        }
    }

    /// Mean elevation over the pixels whose center falls inside the polygon.
    /// `None` when the polygon covers no valid pixel.
    pub fn mean_within(&self, polygon: &MultiPolygon<f64>) -> Option<f64> {
        let bbox = polygon.bounding_rect()?;

        let (c0, r0) = self.transform.geo_to_pixel(bbox.min().x, bbox.max().y);
        let (c1, r1) = self.transform.geo_to_pixel(bbox.max().x, bbox.min().y);
        let col_start = c0.floor().max(0.0) as usize;
        let row_start = r0.floor().max(0.0) as usize;
        let col_end = (c1.ceil().max(0.0) as usize).min(self.width);
        let row_end = (r1.ceil().max(0.0) as usize).min(self.height);

        let mut sum = 0.0f64;
        let mut count = 0u64;
        for row in row_start..row_end {
            for col in col_start..col_end {
                let value = self.data[row * self.width + col];
                if self.is_nodata(value) {
                    continue;
                }
                let (x, y) = self.transform.pixel_to_geo(col as f64 + 0.5, row as f64 + 0.5);
                if polygon.contains(&Point::new(x, y)) {
                    sum += value as f64;
                    count += 1;
                }
            }
        }

        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    // 4x4 grid over [0,4]x[0,4], one degree per pixel, row 0 at the top
    fn raster(data: Vec<f32>, nodata: Option<f64>) -> DemRaster {
        DemRaster {
            width: 4,
            height: 4,
            transform: GeoTransform {
                origin_x: 0.0,
                origin_y: 4.0,
                pixel_width: 1.0,
                pixel_height: -1.0,
            },
            nodata,
            data,
        }
    }

    #[test]
    fn test_geotransform_round_trip() {
        let t = GeoTransform {
            origin_x: 77.4,
            origin_y: 13.2,
            pixel_width: 0.001,
            pixel_height: -0.001,
        };
        let (x, y) = t.pixel_to_geo(10.0, 20.0);
        let (col, row) = t.geo_to_pixel(x, y);
        assert!((col - 10.0).abs() < 1e-9);
        assert!((row - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_within_polygon() {
        // bottom row (row 3, y in [0,1]) holds 100s, everything else 0
        let mut data = vec![0.0f32; 16];
        for col in 0..4 {
            data[3 * 4 + col] = 100.0;
        }
        let dem = raster(data, None);

        let bottom = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 1.0), (x: 0.0, y: 1.0),
        ]]);
        assert_eq!(dem.mean_within(&bottom), Some(100.0));

        let all = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0), (x: 0.0, y: 4.0),
        ]]);
        assert_eq!(dem.mean_within(&all), Some(25.0));
    }

    #[test]
    fn test_mean_skips_nodata() {
        let mut data = vec![-9999.0f32; 16];
        data[0] = 50.0; // top-left pixel, center (0.5, 3.5)
        let dem = raster(data, Some(-9999.0));

        let all = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0), (x: 0.0, y: 4.0),
        ]]);
        assert_eq!(dem.mean_within(&all), Some(50.0));
    }

    #[test]
    fn test_mean_outside_raster_is_none() {
        let dem = raster(vec![1.0; 16], None);
        let far = MultiPolygon::new(vec![polygon![
            (x: 100.0, y: 100.0), (x: 101.0, y: 100.0), (x: 101.0, y: 101.0), (x: 100.0, y: 101.0),
        ]]);
        assert_eq!(dem.mean_within(&far), None);
    }
}
