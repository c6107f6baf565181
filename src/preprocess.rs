use crate::config::AppConfig;
use crate::data;
use crate::dem::DemRaster;
use crate::types::SpeciesCounts;
use anyhow::{Context, Result, anyhow};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo::algorithm::simplify::Simplify;
use geo::{MultiPolygon, Point};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject};
use rayon::prelude::*;
use rstar::{AABB, RTree, RTreeObject};
use serde_json::json;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

pub struct RawWard {
    pub ward_id: String,
    pub ward_name: String,
    pub geometry: MultiPolygon<f64>,
}

// Wrapper for RTree indexing of ward bounding boxes
struct WardIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for WardIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub fn run(config: &AppConfig) -> Result<()> {
    let out_dir = &config.output.processed_dir;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", out_dir))?;

    println!("1) Loading ward boundaries...");
    let wards = load_wards(config)?;
    println!("  -> Wards: {} features", wards.len());

    println!("2) Loading and merging tree census files...");
    let trees = load_trees(config)?;
    println!("  -> Trees: {} features", trees.len());

    println!("3) Loading schools...");
    let schools = load_schools(config)?;
    println!("  -> Schools: {} features", schools.len());

    println!("4) Calculating avg elevation per ward...");
    let avg_elevs = average_elevations(config, &wards)?;

    println!("5) Spatial joins...");
    let index = build_ward_index(&wards);
    let tree_wards: Vec<Option<usize>> = trees
        .par_iter()
        .map(|(_, point)| locate_ward(&index, &wards, point))
        .collect();
    let school_wards: Vec<Option<usize>> = schools
        .par_iter()
        .map(|(_, point)| locate_ward(&index, &wards, point))
        .collect();

    println!("6) Aggregating...");
    // (ward, species) tree counts; points outside every ward are dropped
    let mut tree_counts: HashMap<String, SpeciesCounts> = HashMap::new();
    for ((tree_type, _), ward) in trees.iter().zip(&tree_wards) {
        if let Some(i) = ward {
            *tree_counts
                .entry(wards[*i].ward_id.clone())
                .or_default()
                .entry(tree_type.clone())
                .or_insert(0) += 1;
        }
    }
    let mut school_counts: HashMap<String, u32> = HashMap::new();
    for ward in school_wards.iter().flatten() {
        *school_counts.entry(wards[*ward].ward_id.clone()).or_insert(0) += 1;
    }

    println!("7) Saving outputs...");
    write_wards_geojson(
        &out_dir.join("wards.geojson"),
        config,
        &wards,
        &school_counts,
        &avg_elevs,
        &tree_counts,
    )?;
    write_points_geojson(&out_dir.join("trees.geojson"), "tree_type", &trees)?;
    write_points_geojson(&out_dir.join("schools.geojson"), "name", &schools)?;
    write_ward_stats_csv(
        &out_dir.join("ward_stats.csv"),
        &wards,
        &school_counts,
        &avg_elevs,
    )?;
    write_tree_counts_csv(&out_dir.join("ward_tree_counts.csv"), &wards, &tree_counts)?;

    println!("  -> Outputs in {:?}", out_dir);
    Ok(())
}

/// Integer-restate numeric ward IDs so "007", 7 and 7.0 all export as "7".
fn canonical_id(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.parse::<f64>() {
        Ok(n) => (n.trunc() as i64).to_string(),
        Err(_) => trimmed.to_string(),
    }
}

fn property_text(properties: &JsonObject, field: &str) -> Option<String> {
    match properties.get(field) {
        Some(serde_json::Value::String(s)) => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn load_wards(config: &AppConfig) -> Result<Vec<RawWard>> {
    let extension = config
        .input
        .wards
        .extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Ward boundary file has no extension"))?;

    match extension.as_str() {
        "shp" => load_wards_shapefile(config),
        "json" | "geojson" => load_wards_geojson(config),
        _ => Err(anyhow!("Unsupported ward boundary format: {}", extension)),
    }
}

fn load_wards_geojson(config: &AppConfig) -> Result<Vec<RawWard>> {
    let boundaries = data::load_ward_boundaries(&config.input.wards)?;

    let mut wards = Vec::new();
    for (i, (properties, geometry)) in boundaries.into_iter().enumerate() {
        let ward_id = property_text(&properties, &config.preprocess.ward_id_field)
            .map(|v| canonical_id(&v))
            .unwrap_or_else(|| (i + 1).to_string());
        let ward_name = property_text(&properties, &config.preprocess.ward_name_field)
            .unwrap_or_else(|| format!("Ward {}", ward_id));
        wards.push(RawWard {
            ward_id,
            ward_name,
            geometry,
        });
    }
    Ok(wards)
}

fn load_wards_shapefile(config: &AppConfig) -> Result<Vec<RawWard>> {
    let mut reader = shapefile::Reader::from_path(&config.input.wards)
        .with_context(|| format!("Failed to open Shapefile: {:?}", config.input.wards))?;

    let mut wards = Vec::new();
    for (i, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = result?;

        let geometry = match shape {
            shapefile::Shape::Polygon(polygon) => {
                let geo_polygon: MultiPolygon<f64> = polygon
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?;
                geo_polygon
            }
            shapefile::Shape::PolygonM(polygon) => {
                let geo_polygon: MultiPolygon<f64> = polygon
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?;
                geo_polygon
            }
            shapefile::Shape::PolygonZ(polygon) => {
                let geo_polygon: MultiPolygon<f64> = polygon
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?;
                geo_polygon
            }
            _ => continue, // Skip non-polygon shapes
        };

        let ward_id = match record.get(&config.preprocess.ward_id_field) {
            Some(shapefile::dbase::FieldValue::Character(Some(s))) => canonical_id(s),
            Some(shapefile::dbase::FieldValue::Numeric(Some(n))) => (n.trunc() as i64).to_string(),
            _ => (i + 1).to_string(),
        };
        let ward_name = match record.get(&config.preprocess.ward_name_field) {
            Some(shapefile::dbase::FieldValue::Character(Some(s))) => s.trim().to_string(),
            _ => format!("Ward {}", ward_id),
        };

        wards.push(RawWard {
            ward_id,
            ward_name,
            geometry,
        });
    }
    Ok(wards)
}

/// (tree_type, point) for every tree across the configured zone files.
fn load_trees(config: &AppConfig) -> Result<Vec<(String, Point<f64>)>> {
    let mut trees = Vec::new();
    for path in &config.input.trees {
        let points = match data::load_point_features(path) {
            Ok(points) => points,
            Err(e) => {
                // one bad zone file should not lose the others
                eprintln!("  !! Error reading {:?}: {:#}", path, e);
                continue;
            }
        };
        for (properties, point) in points {
            let tree_type = config
                .preprocess
                .tree_type_fields
                .iter()
                .find_map(|f| property_text(&properties, f))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            trees.push((tree_type, point));
        }
    }
    if trees.is_empty() {
        return Err(anyhow!("No valid tree features found"));
    }
    Ok(trees)
}

/// (name, point) per school; name may be blank.
fn load_schools(config: &AppConfig) -> Result<Vec<(String, Point<f64>)>> {
    let points = data::load_point_features(&config.input.schools)?;
    Ok(points
        .into_iter()
        .map(|(properties, point)| {
            let name = property_text(&properties, "name").unwrap_or_default();
            (name, point)
        })
        .collect())
}

fn average_elevations(
    config: &AppConfig,
    wards: &[RawWard],
) -> Result<HashMap<String, Option<f64>>> {
    let dem_path = match &config.input.dem {
        Some(path) => path,
        None => {
            println!("  -> No DEM configured, skipping elevation");
            return Ok(HashMap::new());
        }
    };
    let dem = DemRaster::open(dem_path)?;
    Ok(wards
        .par_iter()
        .map(|w| (w.ward_id.clone(), dem.mean_within(&w.geometry)))
        .collect())
}

fn build_ward_index(wards: &[RawWard]) -> RTree<WardIndex> {
    let items: Vec<WardIndex> = wards
        .iter()
        .enumerate()
        .filter_map(|(index, ward)| {
            let rect = ward.geometry.bounding_rect()?;
            Some(WardIndex {
                index,
                aabb: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
            })
        })
        .collect();
    RTree::bulk_load(items)
}

fn locate_ward(index: &RTree<WardIndex>, wards: &[RawWard], point: &Point<f64>) -> Option<usize> {
    let envelope = AABB::from_point([point.x(), point.y()]);
    index
        .locate_in_envelope_intersecting(&envelope)
        .find(|candidate| wards[candidate.index].geometry.contains(point))
        .map(|candidate| candidate.index)
}

fn write_wards_geojson(
    path: &Path,
    config: &AppConfig,
    wards: &[RawWard],
    school_counts: &HashMap<String, u32>,
    avg_elevs: &HashMap<String, Option<f64>>,
    tree_counts: &HashMap<String, SpeciesCounts>,
) -> Result<()> {
    let empty = SpeciesCounts::new();
    let tolerance = config.preprocess.simplify_tolerance;

    let features: Vec<Feature> = wards
        .iter()
        .map(|ward| {
            let species = tree_counts.get(&ward.ward_id).unwrap_or(&empty);
            let mut properties = JsonObject::new();
            properties.insert("ward_id".to_string(), json!(ward.ward_id));
            properties.insert("ward_name".to_string(), json!(ward.ward_name));
            properties.insert(
                "num_schools".to_string(),
                json!(school_counts.get(&ward.ward_id).copied().unwrap_or(0)),
            );
            properties.insert(
                "avg_elev".to_string(),
                json!(avg_elevs.get(&ward.ward_id).copied().flatten()),
            );
            // species distribution travels as a JSON string column
            properties.insert(
                "tree_dist".to_string(),
                json!(serde_json::to_string(species).unwrap_or_else(|_| "{}".to_string())),
            );

            let simplified = ward.geometry.simplify(&tolerance);
            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&simplified))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    write_feature_collection(path, features)
}

fn write_points_geojson(
    path: &Path,
    label_field: &str,
    points: &[(String, Point<f64>)],
) -> Result<()> {
    let features: Vec<Feature> = points
        .iter()
        .map(|(label, point)| {
            let mut properties = JsonObject::new();
            properties.insert(label_field.to_string(), json!(label));
            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(point))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    write_feature_collection(path, features)
}

fn write_feature_collection(path: &Path, features: Vec<Feature>) -> Result<()> {
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    let file =
        File::create(path).with_context(|| format!("Failed to create output: {:?}", path))?;
    serde_json::to_writer(BufWriter::new(file), &GeoJson::from(collection))
        .with_context(|| format!("Failed to write GeoJSON: {:?}", path))?;
    Ok(())
}

fn write_ward_stats_csv(
    path: &Path,
    wards: &[RawWard],
    school_counts: &HashMap<String, u32>,
    avg_elevs: &HashMap<String, Option<f64>>,
) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create output: {:?}", path))?;
    wtr.write_record(["ward_id", "ward_name", "num_schools", "avg_elev"])?;
    for ward in wards {
        let schools = school_counts
            .get(&ward.ward_id)
            .copied()
            .unwrap_or(0)
            .to_string();
        let elev = avg_elevs
            .get(&ward.ward_id)
            .copied()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default();
        wtr.write_record([
            ward.ward_id.as_str(),
            ward.ward_name.as_str(),
            schools.as_str(),
            elev.as_str(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_tree_counts_csv(
    path: &Path,
    wards: &[RawWard],
    tree_counts: &HashMap<String, SpeciesCounts>,
) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create output: {:?}", path))?;
    wtr.write_record(["ward_id", "tree_type", "count"])?;
    // ward document order, species alphabetical within a ward
    for ward in wards {
        if let Some(species) = tree_counts.get(&ward.ward_id) {
            for (tree_type, count) in species {
                let count = count.to_string();
                wtr.write_record([
                    ward.ward_id.as_str(),
                    tree_type.as_str(),
                    count.as_str(),
                ])?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn test_canonical_id() {
        assert_eq!(canonical_id("007"), "7");
        assert_eq!(canonical_id(" 42 "), "42");
        assert_eq!(canonical_id("7.0"), "7");
        assert_eq!(canonical_id("W7A"), "W7A");
    }

    #[test]
    fn test_locate_ward_prefers_containing_polygon() {
        let wards = vec![
            RawWard {
                ward_id: "1".to_string(),
                ward_name: "Left".to_string(),
                geometry: MultiPolygon::new(vec![polygon![
                    (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0),
                ]]),
            },
            RawWard {
                ward_id: "2".to_string(),
                ward_name: "Right".to_string(),
                geometry: MultiPolygon::new(vec![polygon![
                    (x: 1.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 1.0), (x: 1.0, y: 1.0),
                ]]),
            },
        ];
        let index = build_ward_index(&wards);

        assert_eq!(locate_ward(&index, &wards, &Point::new(0.5, 0.5)), Some(0));
        assert_eq!(locate_ward(&index, &wards, &Point::new(1.5, 0.5)), Some(1));
        assert_eq!(locate_ward(&index, &wards, &Point::new(5.0, 5.0)), None);
    }
}
