//! Local HTTP API: device registration control, the tracked Ollama proxy
//! and miner history.

pub mod device_status;
pub mod health;
pub mod miner;
pub mod ollama;

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::logging::request_logger;
use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(device_status::router())
        .merge(ollama::router())
        .merge(miner::router())
}

/// Complete application with middleware, ready to serve.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(router())
        .route("/health", get(health::health))
        .layer(middleware::from_fn(request_logger))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
