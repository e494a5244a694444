use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use switchyard_core::events::{FeatureData, FeatureRef};
use switchyard_core::{EventPayload, FeatureName, NewEvent};
use switchyard_store::{FeatureStatus, FeatureToggle, StoreError};

use super::{actor, parse_body, AppState, VERSION};
use crate::error::ApiError;
use crate::validation;

const NOT_FOUND: &str = "Could not find feature";

/// `GET /api/admin/features`
pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let features = state.stores.features.get_features()?;
    Ok(Json(json!({ "version": VERSION, "features": features })))
}

/// `GET /api/admin/features/{name}`
pub async fn get(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<FeatureToggle>, ApiError> {
    let feature = state
        .stores
        .features
        .get_feature(&FeatureName::from_raw(name))
        .map_err(not_found)?;
    Ok(Json(feature))
}

/// `POST /api/admin/features/validate`
pub async fn validate(State(state): State<AppState>, Json(body): Json<Value>) -> Result<StatusCode, ApiError> {
    validate_new(&state, &body)?;
    Ok(StatusCode::CREATED)
}

/// `POST /api/admin/features`
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    validate_new(&state, &body)?;
    let data: FeatureData = parse_body(body)?;
    let stored = state
        .stores
        .events
        .store(NewEvent::new(actor(&headers), EventPayload::FeatureCreated(data)))
        .await?;
    info!(event_id = stored.id, feature = %stored.payload.entity_key(), "feature created");
    Ok(StatusCode::CREATED)
}

/// `PUT /api/admin/features/{name}`. The name in the path wins over any in
/// the body.
pub async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let name = FeatureName::from_raw(name);
    state.stores.features.get_feature(&name).map_err(not_found)?;

    if let Some(fields) = body.as_object_mut() {
        fields.insert("name".into(), Value::String(name.to_string()));
    }
    let data: FeatureData = parse_body(body)?;
    state
        .stores
        .events
        .store(NewEvent::new(actor(&headers), EventPayload::FeatureUpdated(data)))
        .await?;
    Ok(StatusCode::OK)
}

/// `DELETE /api/admin/features/{name}` archives the toggle.
pub async fn archive(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let name = FeatureName::from_raw(name);
    state.stores.features.get_feature(&name).map_err(not_found)?;
    state
        .stores
        .events
        .store(NewEvent::new(
            actor(&headers),
            EventPayload::FeatureArchived(FeatureRef { name }),
        ))
        .await?;
    Ok(StatusCode::OK)
}

/// `GET /api/admin/archive/features`
pub async fn list_archived(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let features = state.stores.features.get_archived_features()?;
    Ok(Json(json!({ "version": VERSION, "features": features })))
}

/// `POST /api/admin/archive/revive/{name}`
pub async fn revive(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let name = FeatureName::from_raw(name);
    if state.stores.features.lookup(&name)? != Some(FeatureStatus::Archived) {
        return Err(ApiError::NotFound(NOT_FOUND.into()));
    }
    state
        .stores
        .events
        .store(NewEvent::new(
            actor(&headers),
            EventPayload::FeatureRevived(FeatureRef { name }),
        ))
        .await?;
    Ok(StatusCode::OK)
}

/// Field checks plus the uniqueness check. Archived toggles keep their name.
fn validate_new(state: &AppState, body: &Value) -> Result<(), ApiError> {
    let mut errors = Vec::new();
    let name = validation::required_key(body, "name", "Name", &mut errors);
    validation::single_strategy_form(body, &mut errors);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    if let Some(name) = name {
        if state.stores.features.lookup(&FeatureName::from(name))?.is_some() {
            return Err(ApiError::NameExists(format!("A feature named '{name}' already exists.")));
        }
    }
    Ok(())
}

fn not_found(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => ApiError::NotFound(NOT_FOUND.into()),
        e => ApiError::Store(e),
    }
}
