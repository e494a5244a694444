use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use switchyard_store::StoreError;

use crate::validation::FieldError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    /// The name or id is already taken; the message is shown to the client.
    #[error("{0}")]
    NameExists(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NameExists(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Validation(errors) => (status, Json(errors)).into_response(),
            Self::NameExists(msg) => (status, Json(json!([{ "msg": msg }]))).into_response(),
            Self::NotFound(msg) => (status, Json(json!({ "error": msg }))).into_response(),
            Self::Store(StoreError::NotFound(msg)) => (status, Json(json!({ "error": msg }))).into_response(),
            Self::Store(e) => {
                error!(kind = e.error_kind(), error = %e, "request failed");
                status.into_response()
            }
        }
    }
}
