use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, events, features, projects, AppState};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 4242,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/admin/features", get(features::list).post(features::create))
        .route("/api/admin/features/validate", post(features::validate))
        .route(
            "/api/admin/features/{name}",
            get(features::get).put(features::update).delete(features::archive),
        )
        .route("/api/admin/archive/features", get(features::list_archived))
        .route("/api/admin/archive/revive/{name}", post(features::revive))
        .route("/api/admin/projects", get(projects::list).post(projects::create))
        .route(
            "/api/admin/projects/{id}",
            get(projects::get).put(projects::update).delete(projects::delete),
        )
        .route("/api/admin/events", get(events::list))
        .route("/api/admin/events/{name}", get(events::history))
        .route("/api/admin/metrics", get(admin::metrics))
        .route("/api/admin/projections/rebuild", post(admin::rebuild))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns once the listener is bound.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "switchyard admin API listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`; the server runs until it is shut down or
/// dropped with the runtime.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        self.server.abort();
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.stores.events.db().ping().is_ok();
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "components": {
                "database": if db_ok { "ok" } else { "error" },
            },
        })),
    )
}
