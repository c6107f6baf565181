use crate::config::AppConfig;
use crate::reconcile;
use crate::types::{SpeciesCounts, TreeCountRecord, WardFeature, WardRecord, WardSummary};
use anyhow::{Context, Result, anyhow};
use csv::ReaderBuilder;
use geo::{MultiPolygon, Point};
use geojson::{GeoJson, JsonObject};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

/// All lookup tables for one session, built once at startup from the
/// processed artifacts and read-only afterwards. A restart is the only
/// refresh path.
pub struct WardContext {
    pub stat_rows: Vec<WardRecord>,
    pub tree_rows: Vec<TreeCountRecord>,
    pub stats: HashMap<String, WardRecord>,
    pub tree_counts: HashMap<String, SpeciesCounts>,
    pub known_keys: HashSet<String>,
    pub wards: Vec<WardFeature>,
}

impl WardContext {
    /// Each dataset loads independently; a failed load is logged and leaves
    /// that table empty rather than aborting the session.
    pub fn load(config: &AppConfig) -> Self {
        let processed = &config.output.processed_dir;

        let stat_rows = match load_ward_stats(&processed.join("ward_stats.csv")) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("ward stats unavailable: {:#}", e);
                Vec::new()
            }
        };
        let tree_rows = match load_tree_counts(&processed.join("ward_tree_counts.csv")) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("ward tree counts unavailable: {:#}", e);
                Vec::new()
            }
        };
        let boundaries = match load_ward_boundaries(&processed.join("wards.geojson")) {
            Ok(features) => features,
            Err(e) => {
                warn!("ward boundaries unavailable: {:#}", e);
                Vec::new()
            }
        };

        let stats: HashMap<String, WardRecord> = stat_rows
            .iter()
            .map(|r| (r.ward_id.clone(), r.clone()))
            .collect();
        let tree_counts = aggregate_tree_counts(&tree_rows);

        let mut known_keys: HashSet<String> = stats.keys().cloned().collect();
        known_keys.extend(tree_counts.keys().cloned());

        let mut unmatched = 0usize;
        let wards: Vec<WardFeature> = boundaries
            .into_iter()
            .map(|(properties, geometry)| {
                let hits = reconcile::matches(&properties, &known_keys);
                let distinct: HashSet<&str> = hits.iter().map(|h| h.key.as_str()).collect();
                if distinct.len() > 1 {
                    warn!("ambiguous ward feature, field order decided: {:?}", hits);
                }
                let key = reconcile::resolve_ward_key(&properties, &known_keys);
                if key.is_none() {
                    unmatched += 1;
                }
                WardFeature {
                    properties,
                    geometry,
                    key,
                }
            })
            .collect();

        info!(
            "ward context: {} stat rows, {} tree count rows, {} boundaries ({} unmatched)",
            stat_rows.len(),
            tree_rows.len(),
            wards.len(),
            unmatched
        );

        WardContext {
            stat_rows,
            tree_rows,
            stats,
            tree_counts,
            known_keys,
            wards,
        }
    }

    pub fn resolve(&self, properties: &JsonObject) -> Option<String> {
        reconcile::resolve_ward_key(properties, &self.known_keys)
    }

    /// Summary for the info panel. `None` (or an unknown key) yields the
    /// placeholder values, never an error.
    pub fn summary(&self, key: Option<&str>) -> WardSummary {
        let key = match key {
            Some(k) => k,
            None => return WardSummary::placeholder(),
        };
        let record = self.stats.get(key);
        let species = self.tree_counts.get(key).cloned().unwrap_or_default();
        let total_trees = species.values().sum();
        WardSummary {
            ward_id: Some(key.to_string()),
            ward_name: record.map(|r| r.ward_name.clone()),
            num_schools: record.map(|r| r.num_schools).unwrap_or(0),
            avg_elev: record.and_then(|r| r.avg_elev),
            total_trees,
            species,
        }
    }
}

pub fn aggregate_tree_counts(rows: &[TreeCountRecord]) -> HashMap<String, SpeciesCounts> {
    let mut counts: HashMap<String, SpeciesCounts> = HashMap::new();
    for row in rows {
        *counts
            .entry(row.ward_id.clone())
            .or_default()
            .entry(row.tree_type.clone())
            .or_insert(0) += row.count;
    }
    counts
}

pub fn load_ward_stats(path: &Path) -> Result<Vec<WardRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    read_ward_stats(file)
}

fn read_ward_stats<R: Read>(reader: R) -> Result<Vec<WardRecord>> {
    let mut rdr = ReaderBuilder::new().from_reader(reader);
    let headers = rdr.headers()?.clone();

    let idx = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("Column '{}' not found in ward stats CSV", name))
    };
    let id_idx = idx("ward_id")?;
    let name_idx = idx("ward_name")?;
    let schools_idx = idx("num_schools")?;
    let elev_idx = idx("avg_elev")?;

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let ward_id = record.get(id_idx).unwrap_or("").trim().to_string();
        if ward_id.is_empty() {
            continue;
        }
        // malformed counts coerce to 0, malformed elevations to absent
        let num_schools = record
            .get(schools_idx)
            .unwrap_or("0")
            .trim()
            .parse()
            .unwrap_or(0);
        let avg_elev = record
            .get(elev_idx)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite());
        rows.push(WardRecord {
            ward_id,
            ward_name: record.get(name_idx).unwrap_or("").trim().to_string(),
            num_schools,
            avg_elev,
        });
    }

    Ok(rows)
}

pub fn load_tree_counts(path: &Path) -> Result<Vec<TreeCountRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    read_tree_counts(file)
}

fn read_tree_counts<R: Read>(reader: R) -> Result<Vec<TreeCountRecord>> {
    let mut rdr = ReaderBuilder::new().from_reader(reader);
    let headers = rdr.headers()?.clone();

    let idx = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("Column '{}' not found in tree counts CSV", name))
    };
    let id_idx = idx("ward_id")?;
    let type_idx = idx("tree_type")?;
    let count_idx = idx("count")?;

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let ward_id = record.get(id_idx).unwrap_or("").trim().to_string();
        if ward_id.is_empty() {
            continue;
        }
        rows.push(TreeCountRecord {
            ward_id,
            tree_type: record.get(type_idx).unwrap_or("unknown").trim().to_string(),
            count: record.get(count_idx).unwrap_or("0").trim().parse().unwrap_or(0),
        });
    }

    Ok(rows)
}

/// Boundary features: raw properties in document order plus the polygon.
/// Non-polygon features are skipped.
pub fn load_ward_boundaries(path: &Path) -> Result<Vec<(JsonObject, MultiPolygon<f64>)>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let geojson = GeoJson::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse GeoJSON: {:?}", path))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut boundaries = Vec::new();
    for feature in collection.features {
        let geometry = match feature.geometry {
            Some(geometry) => {
                let geom: geo::Geometry<f64> = geometry
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geometry: {:?}", e))?;
                match geom {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => continue,
                }
            }
            None => continue,
        };
        boundaries.push((feature.properties.unwrap_or_default(), geometry));
    }

    Ok(boundaries)
}

/// Point features from a GeoJSON file, MultiPoints flattened. The returned
/// properties are shared by every point of a MultiPoint feature.
pub fn load_point_features(path: &Path) -> Result<Vec<(JsonObject, Point<f64>)>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let geojson = GeoJson::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse GeoJSON: {:?}", path))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut points = Vec::new();
    for feature in collection.features {
        let properties = feature.properties.unwrap_or_default();
        let geometry = match feature.geometry {
            Some(geometry) => geometry,
            None => continue,
        };
        let geom: geo::Geometry<f64> = match geometry.value.try_into() {
            Ok(g) => g,
            Err(_) => continue,
        };
        match geom {
            geo::Geometry::Point(p) => points.push((properties, p)),
            geo::Geometry::MultiPoint(mp) => {
                for p in mp {
                    points.push((properties.clone(), p));
                }
            }
            _ => continue,
        }
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ward_id: &str, tree_type: &str, count: u64) -> TreeCountRecord {
        TreeCountRecord {
            ward_id: ward_id.to_string(),
            tree_type: tree_type.to_string(),
            count,
        }
    }

    fn context_with(rows: Vec<WardRecord>, trees: Vec<TreeCountRecord>) -> WardContext {
        let stats: HashMap<String, WardRecord> =
            rows.iter().map(|r| (r.ward_id.clone(), r.clone())).collect();
        let tree_counts = aggregate_tree_counts(&trees);
        let mut known_keys: HashSet<String> = stats.keys().cloned().collect();
        known_keys.extend(tree_counts.keys().cloned());
        WardContext {
            stat_rows: rows,
            tree_rows: trees,
            stats,
            tree_counts,
            known_keys,
            wards: Vec::new(),
        }
    }

    #[test]
    fn test_tree_count_aggregation() {
        let counts = aggregate_tree_counts(&[
            record("7", "Neem", 3),
            record("7", "Banyan", 5),
            record("8", "Neem", 1),
        ]);
        let ward7 = &counts["7"];
        assert_eq!(ward7.get("Neem"), Some(&3));
        assert_eq!(ward7.get("Banyan"), Some(&5));
        assert_eq!(ward7.values().sum::<u64>(), 8);
        assert_eq!(counts["8"].values().sum::<u64>(), 1);
    }

    #[test]
    fn test_summary_for_known_ward() {
        let ctx = context_with(
            vec![WardRecord {
                ward_id: "7".to_string(),
                ward_name: "Hebbal".to_string(),
                num_schools: 4,
                avg_elev: Some(912.5),
            }],
            vec![record("7", "Neem", 3), record("7", "Banyan", 5)],
        );
        let summary = ctx.summary(Some("7"));
        assert_eq!(summary.ward_name.as_deref(), Some("Hebbal"));
        assert_eq!(summary.num_schools, 4);
        assert_eq!(summary.avg_elev, Some(912.5));
        assert_eq!(summary.total_trees, 8);
        assert_eq!(summary.species.get("Neem"), Some(&3));
    }

    #[test]
    fn test_summary_placeholder_for_no_match() {
        let ctx = context_with(Vec::new(), Vec::new());
        let summary = ctx.summary(None);
        assert_eq!(summary.num_schools, 0);
        assert_eq!(summary.avg_elev, None);
        assert_eq!(summary.total_trees, 0);
        assert!(summary.species.is_empty());
    }

    #[test]
    fn test_known_keys_are_union_of_both_tables() {
        let ctx = context_with(
            vec![WardRecord {
                ward_id: "7".to_string(),
                ward_name: "Hebbal".to_string(),
                num_schools: 0,
                avg_elev: None,
            }],
            vec![record("12", "Neem", 1)],
        );
        assert!(ctx.known_keys.contains("7"));
        assert!(ctx.known_keys.contains("12"));

        // a ward present only in the tree census still resolves
        let p: JsonObject = serde_json::from_str(r#"{"ward_id": "012"}"#).unwrap();
        assert_eq!(ctx.resolve(&p), Some("12".to_string()));
    }

    #[test]
    fn test_csv_coercion_of_malformed_numerics() {
        let csv = "ward_id,ward_name,num_schools,avg_elev\n\
                   7,Hebbal,three,n/a\n\
                   8,Koramangala,2,842.1\n\
                   ,Orphan,1,\n";
        let rows = read_ward_stats(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2); // empty ward_id row dropped
        assert_eq!(rows[0].num_schools, 0);
        assert_eq!(rows[0].avg_elev, None);
        assert_eq!(rows[1].num_schools, 2);
        assert_eq!(rows[1].avg_elev, Some(842.1));
    }

    #[test]
    fn test_tree_counts_csv() {
        let csv = "ward_id,tree_type,count\n7,Neem,3\n7,Banyan,bad\n";
        let rows = read_tree_counts(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].count, 3);
        assert_eq!(rows[1].count, 0);
    }
}
