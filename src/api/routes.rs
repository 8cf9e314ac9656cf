//! API route definitions.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::filters::{compile_filters, ActiveFilter};
use crate::identity::generate_id;
use crate::report::{build_report, legacy_report, SeriesInput};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/detect", post(detect))
        .route("/anomaly-id", post(anomaly_id))
        .route(
            "/investigations",
            get(list_investigations).delete(clear_investigations),
        )
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct DetectBody {
    #[serde(flatten)]
    series: SeriesInput,
    #[serde(default)]
    time_filter: String,
    #[serde(default)]
    filters: Vec<ActiveFilter>,
    max_count: Option<usize>,
    #[serde(default)]
    legacy: bool,
}

async fn detect(State(state): State<AppState>, Json(body): Json<DetectBody>) -> ApiResult<Json<Value>> {
    let options = state.config.detection.options();

    if body.legacy {
        let best = legacy_report(&body.series, &options)?;
        return Ok(Json(json!({ "data": { "best": best }, "meta": meta() })));
    }

    let max_count = body.max_count.unwrap_or(state.config.detection.max_count);
    let filters = compile_filters(&body.filters);
    let report = build_report(&body.series, &body.time_filter, &filters.map, max_count, &options)?;
    tracing::debug!(anomalies = report.anomalies.len(), buckets = report.buckets, "detection served");

    Ok(Json(json!({
        "data": report,
        "meta": { "total": report.anomalies.len(), "timestamp": Utc::now().to_rfc3339() }
    })))
}

#[derive(Debug, Deserialize)]
struct AnomalyIdBody {
    #[serde(default)]
    time_filter: String,
    #[serde(default)]
    filters: Vec<ActiveFilter>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    category: String,
}

async fn anomaly_id(Json(body): Json<AnomalyIdBody>) -> ApiResult<Json<Value>> {
    if body.end < body.start {
        return Err(ApiError::BadRequest("end precedes start".to_string()));
    }
    let filters = compile_filters(&body.filters);
    let id = generate_id(
        &body.time_filter,
        &filters.map.canonical(),
        body.start,
        body.end,
        &body.category,
    );
    Ok(Json(json!({ "data": { "id": id }, "meta": meta() })))
}

async fn list_investigations(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cache = state.cache.clone();
    let entries = tokio::task::spawn_blocking(move || cache.entries()).await?;
    Ok(Json(json!({ "data": entries, "meta": { "total": entries.len() } })))
}

async fn clear_investigations(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cache = state.cache.clone();
    let removed = tokio::task::spawn_blocking(move || cache.clear()).await?;
    tracing::info!(removed, "investigation cache cleared");
    Ok(Json(json!({ "data": { "removed": removed } })))
}
