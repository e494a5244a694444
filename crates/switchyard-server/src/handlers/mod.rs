//! HTTP handlers organized by resource. Each one validates, checks its
//! precondition against a projection's read API, and issues `store`.

pub mod admin;
pub mod events;
pub mod features;
pub mod projects;

use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::Value;

use switchyard_store::Stores;
use switchyard_telemetry::MetricsRecorder;

use crate::error::ApiError;

/// Wire format version carried by list responses.
pub const VERSION: u32 = 1;

/// Shared state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

impl AppState {
    pub fn new(stores: Stores) -> Self {
        Self { stores, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Who is making the request: `x-username` header, then the `username`
/// cookie, else "unknown".
pub fn actor(headers: &HeaderMap) -> String {
    if let Some(name) = headers
        .get("x-username")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return name.to_string();
    }

    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == "username" && !value.is_empty())
        .map_or_else(|| "unknown".to_string(), |(_, value)| value.to_string())
}

/// Deserialize a request body that already passed field validation.
fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| {
        ApiError::Validation(vec![crate::validation::FieldError::new("body", e.to_string(), None)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn actor_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-username", HeaderValue::from_static("alice"));
        headers.insert("cookie", HeaderValue::from_static("username=bob"));
        assert_eq!(actor(&headers), "alice");
    }

    #[test]
    fn actor_falls_back_to_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("theme=dark; username=bob"));
        assert_eq!(actor(&headers), "bob");
    }

    #[test]
    fn actor_defaults_to_unknown() {
        assert_eq!(actor(&HeaderMap::new()), "unknown");
        let mut headers = HeaderMap::new();
        headers.insert("x-username", HeaderValue::from_static("  "));
        assert_eq!(actor(&headers), "unknown");
    }

    #[test]
    fn parse_body_reports_shape_errors() {
        let err = parse_body::<switchyard_core::events::FeatureData>(serde_json::json!({"name": "f", "enabled": "yes"}))
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(ref errors) if errors[0].param == "body"));
    }
}
