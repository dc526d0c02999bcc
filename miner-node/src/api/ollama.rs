//! Ollama-compatible inference proxy with task tracking.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::engine::{resolve_stream_flag, EngineEndpoint};
use crate::error::{Error, Result};
use crate::state::AppState;

const NDJSON: &str = "application/x-ndjson";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ollama/api/chat", post(chat))
        .route("/ollama/api/generate", post(generate))
}

/// POST /ollama/api/chat
async fn chat(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Result<Response> {
    proxy(&state, EngineEndpoint::Chat, body).await
}

/// POST /ollama/api/generate
async fn generate(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Result<Response> {
    proxy(&state, EngineEndpoint::Generate, body).await
}

async fn proxy(state: &AppState, endpoint: EngineEndpoint, mut body: Value) -> Result<Response> {
    if !body.is_object() {
        return Err(Error::InvalidRequest("request body must be a JSON object".to_string()));
    }

    if resolve_stream_flag(&mut body) {
        let lines = state.tasks.run_stream(endpoint, &body).await?;
        Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response())
    } else {
        let answer = state.tasks.run_unary(endpoint, &body).await?;
        Ok(Json(answer).into_response())
    }
}
