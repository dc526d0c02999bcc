//! Device registration control endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use crate::device::{
    AckRecord, AutoRegistrationStatus, DeviceConfig, DeviceStatusRecord, RegistrationCredentials,
    RegistrationOutcome, RegistrationState,
};
use crate::error::Result;
use crate::startup::{self, StartupStatus};
use crate::state::AppState;
use crate::tunnel::ConnectionState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/device-status", get(device_status))
        .route("/api/v1/device-status/register", post(register))
        .route("/api/v1/device-status/unregister", post(unregister))
        .route("/api/v1/device-status/gateway-status", get(gateway_status))
        .route("/api/v1/device-status/list", get(list))
        .route("/api/v1/device-status/auto-registration", get(auto_registration))
        .route("/api/v1/device-status/reinitialize", post(reinitialize))
}

/// POST /api/v1/device-status/register
async fn register(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<RegistrationCredentials>,
) -> (StatusCode, String) {
    let outcome = state.registration.register(credentials).await;
    if outcome.success {
        (
            StatusCode::OK,
            "Registration successful, starting heartbeat".to_string(),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            outcome.error.unwrap_or_else(|| "Registration failed".to_string()),
        )
    }
}

/// POST /api/v1/device-status/unregister
async fn unregister(State(state): State<Arc<AppState>>) -> (StatusCode, Json<RegistrationOutcome>) {
    let outcome = state.registration.unregister().await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(outcome))
}

/// GET /api/v1/device-status/gateway-status
async fn gateway_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "isRegistered": state.registration.is_registered() }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStatusView {
    config: DeviceConfig,
    state: RegistrationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack: Option<AckRecord>,
    tunnel: ConnectionState,
}

/// GET /api/v1/device-status - current device record (key redacted).
async fn device_status(State(state): State<Arc<AppState>>) -> Json<DeviceStatusView> {
    let registration = &state.registration;
    Json(DeviceStatusView {
        config: registration.current_config().redacted(),
        state: registration.state(),
        last_error: registration.last_error(),
        ack: registration.ack_status(),
        tunnel: state.tunnel.state(),
    })
}

/// GET /api/v1/device-status/list
async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<DeviceStatusRecord>>> {
    Ok(Json(state.store.list_device_status()?))
}

/// GET /api/v1/device-status/auto-registration
async fn auto_registration(State(state): State<Arc<AppState>>) -> Json<AutoRegistrationStatus> {
    Json(state.auto_registration.status())
}

/// POST /api/v1/device-status/reinitialize
async fn reinitialize(State(state): State<Arc<AppState>>) -> Json<StartupStatus> {
    // Registration keeps retrying in the background.
    drop(startup::reinitialize(&state).await);
    Json(startup::startup_status(&state))
}
