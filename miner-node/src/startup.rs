//! Boot-time initialization: restore the device record, reconnect, and kick
//! off auto-registration.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::device::{AutoRegistrationStatus, DeviceConfig};
use crate::state::AppState;

/// Snapshot reported after (re)initialization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupStatus {
    pub has_registration_info: bool,
    pub is_registered: bool,
    pub tunnel_connected: bool,
    pub auto_registration: AutoRegistrationStatus,
}

/// Restore the persisted record, reopen the tunnel if the device was
/// registered, and start auto-registration in the background.
pub async fn initialize(state: &Arc<AppState>) -> JoinHandle<bool> {
    tracing::info!("Starting initialization");

    let record = match state.store.load_device_config() {
        Ok(record) => record,
        Err(e) => {
            tracing::error!("Failed to load device record: {}", e);
            None
        }
    };

    match record {
        Some(record) if record.has_registration_info() => {
            tracing::info!("Found stored registration info");
            let reconnect = record.is_registered;
            state.registration.restore(record.clone()).await;
            if reconnect {
                reconnect_tunnel(state, &record).await;
            } else {
                tracing::info!("Device not registered yet, attempting initial registration");
            }
        }
        Some(record) => state.registration.restore(record).await,
        None => {
            tracing::info!("No stored registration info, register through the device-status API");
        }
    }

    let auto_registration = state.auto_registration.clone();
    let handle = tokio::spawn(async move {
        let registered = auto_registration.run().await;
        if !registered && auto_registration.stored_credentials().is_some() {
            tracing::warn!("Auto-registration did not complete");
        }
        registered
    });

    log_summary(state);
    handle
}

/// Manual retry after auto-registration gave up. Returns once the retry
/// loop is spawned; the handle resolves when it finishes.
pub async fn reinitialize(state: &Arc<AppState>) -> JoinHandle<bool> {
    tracing::info!("Manual reinitialization requested");
    state.auto_registration.reset();
    initialize(state).await
}

pub fn startup_status(state: &AppState) -> StartupStatus {
    StartupStatus {
        has_registration_info: state.auto_registration.stored_credentials().is_some(),
        is_registered: state.registration.is_registered(),
        tunnel_connected: state.tunnel.is_connected(),
        auto_registration: state.auto_registration.status(),
    }
}

async fn reconnect_tunnel(state: &AppState, record: &DeviceConfig) {
    tracing::info!("Device was registered, reconnecting to {}", record.gateway_address);

    if let Err(e) = state.registration.open_tunnel(record).await {
        tracing::error!("Failed to reopen tunnel: {}", e);
        return;
    }

    let wait = Duration::from_secs(state.config.gateway.tunnel_wait_secs);
    if state.tunnel.connection().wait_for_connection(wait).await {
        tracing::info!("Tunnel re-established");
    } else {
        tracing::warn!("Tunnel not connected after {:?}", wait);
    }
}

fn log_summary(state: &AppState) {
    let config = state.registration.current_config();
    let auto = state.auto_registration.status();
    let or_unset = |value: &str| {
        if value.is_empty() {
            "Not set".to_string()
        } else {
            value.to_string()
        }
    };

    tracing::info!("Startup status summary:");
    tracing::info!("  Device ID: {}", or_unset(&config.device_id));
    tracing::info!("  Device name: {}", or_unset(&config.device_name));
    tracing::info!("  Gateway: {}", or_unset(&config.gateway_address));
    tracing::info!("  Registered: {}", config.is_registered);
    tracing::info!(
        "  Auto-registration: {}",
        if auto.is_registering { "in progress" } else { "idle" }
    );
    if auto.retry_count > 0 {
        tracing::info!("  Retry count: {}/{}", auto.retry_count, auto.max_retries);
    }

    if !config.has_registration_info() {
        tracing::info!("Next steps: register the device with POST /api/v1/device-status/register");
        tracing::info!("  providing gateway_address, reward_address, key and code");
    } else if !config.is_registered {
        tracing::info!("Registration will be retried automatically");
        tracing::info!("  check gateway reachability and the stored credentials if it keeps failing");
    } else {
        tracing::info!("Device ready, heartbeat active");
    }
}
