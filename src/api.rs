// src/api.rs
//! HTTP surface: the scrape endpoint plus raw-data, cache-status and
//! manual refresh endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::exporter::Exporter;
use crate::exposition::{MetricExposer, CONTENT_TYPE};
use crate::pipeline::scheduler::TriggerOutcome;
use crate::snapshot::{CycleState, PipelineHealth, RowStats};

#[derive(Clone)]
pub struct AppState {
    pub exporter: Arc<Exporter>,
    pub exposer: Arc<MetricExposer>,
}

impl AppState {
    /// State whose `/metrics` carries only the artifact data and meta-metrics.
    pub fn new(exporter: Arc<Exporter>) -> Self {
        let exposer = Arc::new(exporter.exposer());
        Self { exporter, exposer }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/api/v1/data/{*filename}", get(data))
        .route("/api/v1/cache/status", get(cache_status))
        .route("/admin/refresh", post(admin_refresh))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = state.exposer.render();
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

/// Raw payload behind the current snapshot of one artifact. `filename` may
/// be the artifact name or its configured path, slashes included.
async fn data(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    let Some(pipeline) = state.exporter.find(&filename) else {
        tracing::warn!(target: "api", %filename, "unknown artifact requested");
        return not_cached(&filename);
    };
    let view = pipeline.slot.load();
    if !view.snapshot.is_published() {
        return not_cached(&filename);
    }
    (
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        view.snapshot.payload.clone(),
    )
        .into_response()
}

fn not_cached(filename: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("artifact {filename} not found in cache"),
    )
        .into_response()
}

#[derive(Serialize)]
struct ArtifactStatus {
    state: CycleState,
    generation: u64,
    last_updated: Option<String>,
    bytes_in_cache: usize,
    rows: RowStats,
    health: PipelineHealth,
}

async fn cache_status(State(state): State<AppState>) -> Json<BTreeMap<String, ArtifactStatus>> {
    let out = state
        .exporter
        .views()
        .into_iter()
        .map(|v| {
            let status = ArtifactStatus {
                state: v.state,
                generation: v.snapshot.generation,
                last_updated: v.snapshot.fetched_at.map(|t| t.to_rfc3339()),
                bytes_in_cache: v.snapshot.payload.len(),
                rows: v.snapshot.rows,
                health: v.health.clone(),
            };
            (v.artifact.clone(), status)
        })
        .collect();
    Json(out)
}

async fn admin_refresh(State(state): State<AppState>) -> Json<BTreeMap<String, TriggerOutcome>> {
    let outcomes: BTreeMap<_, _> = state.exporter.trigger_all().into_iter().collect();
    tracing::info!(target: "api", ?outcomes, "manual refresh requested");
    Json(outcomes)
}
