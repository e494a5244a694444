use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use switchyard_core::events::{ProjectData, ProjectRef};
use switchyard_core::{EventPayload, NewEvent, ProjectId};
use switchyard_store::Project;

use super::{actor, parse_body, AppState, VERSION};
use crate::error::ApiError;
use crate::validation;

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let projects = state.stores.projects.get_all()?;
    Ok(Json(json!({ "version": VERSION, "projects": projects })))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.stores.projects.get(&ProjectId::from_raw(id))?))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let mut errors = Vec::new();
    let id = validation::required_key(&body, "id", "Id", &mut errors);
    validation::required(&body, "name", "Name", &mut errors);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    if let Some(id) = id {
        if state.stores.projects.id_taken(&ProjectId::from(id))? {
            return Err(ApiError::NameExists(format!("A project with id '{id}' already exists.")));
        }
    }

    let data: ProjectData = parse_body(body)?;
    state
        .stores
        .events
        .store(NewEvent::new(actor(&headers), EventPayload::ProjectCreated(data)))
        .await?;
    Ok(StatusCode::CREATED)
}

/// The id in the path wins over any in the body.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let id = ProjectId::from_raw(id);
    let mut errors = Vec::new();
    validation::required(&body, "name", "Name", &mut errors);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    if !state.stores.projects.exists(&id)? {
        return Err(ApiError::NotFound(format!("No project found with id '{id}'")));
    }

    if let Some(fields) = body.as_object_mut() {
        fields.insert("id".into(), Value::String(id.to_string()));
    }
    let data: ProjectData = parse_body(body)?;
    state
        .stores
        .events
        .store(NewEvent::new(actor(&headers), EventPayload::ProjectUpdated(data)))
        .await?;
    Ok(StatusCode::OK)
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let id = ProjectId::from_raw(id);
    if !state.stores.projects.exists(&id)? {
        return Err(ApiError::NotFound(format!("No project found with id '{id}'")));
    }
    state
        .stores
        .events
        .store(NewEvent::new(actor(&headers), EventPayload::ProjectDeleted(ProjectRef { id })))
        .await?;
    Ok(StatusCode::OK)
}
