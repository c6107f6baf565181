use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    pub preprocess: PreprocessConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub wards: PathBuf, // .shp or .geojson
    pub schools: PathBuf,
    pub trees: Vec<PathBuf>,
    pub dem: Option<PathBuf>, // georeferenced GeoTIFF, EPSG:4326
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessConfig {
    #[serde(default = "default_ward_id_field")]
    pub ward_id_field: String,
    #[serde(default = "default_ward_name_field")]
    pub ward_name_field: String,
    // Checked in order; the first field present on a tree feature wins
    #[serde(default = "default_tree_type_fields")]
    pub tree_type_fields: Vec<String>,
    #[serde(default = "default_simplify_tolerance")]
    pub simplify_tolerance: f64,
}

fn default_ward_id_field() -> String {
    "KGISWardNo".to_string()
}

fn default_ward_name_field() -> String {
    "KGISWardName".to_string()
}

fn default_tree_type_fields() -> Vec<String> {
    vec!["TreeName".to_string(), "tree_type".to_string()]
}

fn default_simplify_tolerance() -> f64 {
    0.0001 // ~11m
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub processed_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: PathBuf,
    pub tile_dir: PathBuf,
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}
