//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health - node liveness plus engine, registration and tunnel state.
///
/// Always 200 while the node is serving; an unreachable engine is reported
/// in the body.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let engine = match state.engine.health_check().await {
        Ok(health) => json!({
            "type": state.engine.engine_type(),
            "healthy": health.is_healthy,
            "models": health.models_loaded,
        }),
        Err(e) => json!({
            "type": state.engine.engine_type(),
            "healthy": false,
            "error": e.to_string(),
        }),
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "engine": engine,
            "registered": state.registration.is_registered(),
            "tunnelConnected": state.tunnel.is_connected(),
        })),
    )
}
