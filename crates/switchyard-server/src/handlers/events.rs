use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use switchyard_core::EntityKind;

use super::{AppState, VERSION};
use crate::error::ApiError;

/// Events returned by the unfiltered feed.
const FEED_LIMIT: usize = 100;

/// `GET /api/admin/events`, newest first.
pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let events = state.stores.events.recent(FEED_LIMIT)?;
    Ok(Json(json!({ "version": VERSION, "events": events })))
}

/// `GET /api/admin/events/{name}`: history of one feature toggle.
pub async fn history(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<Value>, ApiError> {
    let events = state.stores.events.for_entity(EntityKind::Feature, &name)?;
    Ok(Json(json!({ "version": VERSION, "toggleName": name, "events": events })))
}
