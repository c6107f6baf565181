use geo::MultiPolygon;
use geojson::JsonObject;
use serde::Serialize;
use std::collections::BTreeMap;

// Species label -> tree count; ordered so serialized output is stable
pub type SpeciesCounts = BTreeMap<String, u64>;

#[derive(Debug, Clone, Serialize)]
pub struct WardRecord {
    pub ward_id: String,
    pub ward_name: String,
    pub num_schools: u32,
    pub avg_elev: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeCountRecord {
    pub ward_id: String,
    pub tree_type: String,
    pub count: u64,
}

/// A ward boundary polygon with its raw document properties (kept in document
/// order) and the canonical key it resolved to, if any.
#[derive(Debug, Clone)]
pub struct WardFeature {
    pub properties: JsonObject,
    pub geometry: MultiPolygon<f64>,
    pub key: Option<String>,
}

/// What the info panel renders for a selected ward. Unmatched wards get the
/// placeholder values instead of an error.
#[derive(Debug, Clone, Serialize)]
pub struct WardSummary {
    pub ward_id: Option<String>,
    pub ward_name: Option<String>,
    pub num_schools: u32,
    pub avg_elev: Option<f64>,
    pub total_trees: u64,
    pub species: SpeciesCounts,
}

impl WardSummary {
    pub fn placeholder() -> Self {
        WardSummary {
            ward_id: None,
            ward_name: None,
            num_schools: 0,
            avg_elev: None,
            total_trees: 0,
            species: SpeciesCounts::new(),
        }
    }
}
