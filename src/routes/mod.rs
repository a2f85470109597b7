//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The bridge exposes one websocket endpoint that carries all session
//! traffic, plus two small HTTP endpoints: a health check and the client
//! config the browser SDK needs to boot (publishable key only).

pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/config", get(client_config))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn client_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let wait_ms = u64::try_from(state.config.auth_wait_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(serde_json::json!({
        "publishable_key": state.config.publishable_key,
        "auth_wait_timeout_ms": wait_ms,
    }))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
