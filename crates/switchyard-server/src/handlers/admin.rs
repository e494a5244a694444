use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::error::ApiError;

/// `GET /api/admin/metrics`
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let samples = state.metrics.as_ref().map(|m| m.snapshot()).unwrap_or_default();
    Json(json!({ "metrics": samples }))
}

/// `POST /api/admin/projections/rebuild`: replay the log into every
/// projection. New writes wait until the replay is done.
pub async fn rebuild(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let reports = state.stores.rebuild_all().await?;
    info!(projections = reports.len(), "projections rebuilt on request");
    Ok(Json(json!({ "projections": reports })))
}
