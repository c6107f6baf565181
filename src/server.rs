use crate::config::AppConfig;
use crate::data::WardContext;
use crate::types::{TreeCountRecord, WardRecord, WardSummary};
use anyhow::Result;
use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use geo::Point;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geojson::JsonObject;
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

// Wrapper for RTree indexing
struct AreaIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for AreaIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub struct AppState {
    pub ctx: WardContext,
    pub tree: RTree<AreaIndex>,
    pub config: AppConfig,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
pub struct SummaryParams {
    key: Option<String>,
}

#[derive(Serialize)]
pub struct QueryResponse {
    key: Option<String>,
    summary: WardSummary,
    properties: JsonObject,
}

pub async fn start_server(config: AppConfig, ctx: WardContext) -> Result<()> {
    // Build Spatial Index over the boundary layer
    println!("Building spatial index for API...");
    let tree_items: Vec<AreaIndex> = ctx
        .wards
        .iter()
        .enumerate()
        .filter_map(|(index, ward)| {
            let rect = ward.geometry.bounding_rect()?;
            Some(AreaIndex {
                index,
                aabb: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
            })
        })
        .collect();
    let tree = RTree::bulk_load(tree_items);
    println!("Spatial index built.");

    let port = config.server.port;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let static_dir = config.server.static_dir.clone();
    let tile_dir = config.server.tile_dir.clone();
    let processed_dir = config.output.processed_dir.clone();

    let state = Arc::new(AppState { ctx, tree, config });

    println!("Starting server on http://{}", addr);

    let app = Router::new()
        .route("/api/ward_stats", get(ward_stats_handler))
        .route("/api/ward_tree_counts", get(ward_tree_counts_handler))
        .route("/api/ward_summary", get(ward_summary_handler))
        .route("/api/query", get(query_handler))
        .nest_service("/data/processed", ServeDir::new(processed_dir))
        .nest_service("/tiles", ServeDir::new(tile_dir))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ward_stats_handler(State(state): State<Arc<AppState>>) -> Json<Vec<WardRecord>> {
    Json(state.ctx.stat_rows.clone())
}

async fn ward_tree_counts_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<TreeCountRecord>> {
    Json(state.ctx.tree_rows.clone())
}

/// Renderer-facing summary lookup; an unknown or absent key answers with the
/// placeholder summary, never an error.
async fn ward_summary_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SummaryParams>,
) -> Json<WardSummary> {
    Json(state.ctx.summary(params.key.as_deref()))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<QueryResponse>> {
    let point = Point::new(params.lon, params.lat);
    let envelope = AABB::from_point([params.lon, params.lat]);

    let candidates = state.tree.locate_in_envelope_intersecting(&envelope);

    for candidate in candidates {
        if let Some(ward) = state.ctx.wards.get(candidate.index) {
            if ward.geometry.contains(&point) {
                return Json(Some(QueryResponse {
                    key: ward.key.clone(),
                    summary: state.ctx.summary(ward.key.as_deref()),
                    properties: ward.properties.clone(),
                }));
            }
        }
    }

    Json(None)
}
