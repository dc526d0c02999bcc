//! Error types for the miner node HTTP surface and inference proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::device::GatewayError;
use crate::store::StoreError;
use crate::tunnel::TunnelError;

/// Error types for inference and API operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Engine not available: {0}")]
    EngineNotAvailable(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Engine communication error: {0}")]
    Communication(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::EngineNotAvailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable"),
            Error::InferenceFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "inference_failed"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::Communication(_) => (StatusCode::BAD_GATEWAY, "communication_error"),
            Error::TaskNotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
            Error::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort node startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to open database: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to build gateway client: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Invalid tunnel handler table: {0}")]
    Tunnel(#[from] TunnelError),
}
