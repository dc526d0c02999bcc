//! Device registration state machine.
//!
//! Registration is two-phase. The HTTP call to `{gateway}/node/register`
//! makes the device `Registered` and opens the tunnel; the gateway later
//! confirms over the tunnel with `device_register_ack`, which is recorded as
//! the ack status.
//!
//! The live [`DeviceConfig`] is only written by the transition methods here.
//! `register` and `unregister` are serialized by a transition lock.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;

use miner_common::protocol::DEVICE_REGISTER_REQUEST;
use miner_common::{DeviceRegisterRequest, PeerId, RegisterRequest, TunnelMessage};

use super::{DeviceConfig, GatewayApi, SystemProbe};
use crate::config::GatewayConfig;
use crate::store::Store;
use crate::tunnel::{AckStatus, TunnelError, TunnelEvent, TunnelService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    RegistrationFailed,
}

/// Operator-supplied registration input.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationCredentials {
    pub code: String,
    pub gateway_address: String,
    pub reward_address: String,
    pub key: String,
    #[serde(default)]
    pub base_path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("Registration request failed: {0}")]
    Network(String),

    #[error("Failed to persist registration: {0}")]
    Store(String),
}

/// Result of a registration transition. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl RegistrationOutcome {
    fn registered(device_id: String, device_name: String) -> Self {
        Self {
            success: true,
            error: None,
            device_id: Some(device_id),
            device_name: Some(device_name),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            device_id: None,
            device_name: None,
        }
    }
}

/// Last tunnel-level acknowledgment from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRecord {
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
}

struct Status {
    state: RegistrationState,
    last_error: Option<String>,
    ack: Option<AckRecord>,
}

pub struct DeviceRegistrationStateMachine {
    config: RwLock<DeviceConfig>,
    status: RwLock<Status>,
    transition: Mutex<()>,
    heartbeat_trigger: Arc<Notify>,
    gateway: Arc<dyn GatewayApi>,
    probe: Arc<dyn SystemProbe>,
    tunnel: Arc<TunnelService>,
    store: Arc<dyn Store>,
    gateway_peer: PeerId,
    default_base_path: String,
}

impl DeviceRegistrationStateMachine {
    pub fn new(
        gateway_config: &GatewayConfig,
        gateway: Arc<dyn GatewayApi>,
        probe: Arc<dyn SystemProbe>,
        tunnel: Arc<TunnelService>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            config: RwLock::new(DeviceConfig::default()),
            status: RwLock::new(Status {
                state: RegistrationState::Unregistered,
                last_error: None,
                ack: None,
            }),
            transition: Mutex::new(()),
            heartbeat_trigger: Arc::new(Notify::new()),
            gateway,
            probe,
            tunnel,
            store,
            gateway_peer: PeerId::new(gateway_config.peer_id.clone()),
            default_base_path: gateway_config.base_path.clone(),
        }
    }

    fn read_config(&self) -> RwLockReadGuard<'_, DeviceConfig> {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_config(&self) -> RwLockWriteGuard<'_, DeviceConfig> {
        self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_status(&self) -> RwLockWriteGuard<'_, Status> {
        self.status.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_status(&self) -> RwLockReadGuard<'_, Status> {
        self.status.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: RegistrationState, last_error: Option<String>) {
        let mut status = self.write_status();
        status.state = state;
        status.last_error = last_error;
    }

    /// Snapshot of the live device configuration.
    pub fn current_config(&self) -> DeviceConfig {
        self.read_config().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.read_config().is_registered
    }

    pub fn state(&self) -> RegistrationState {
        self.read_status().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.read_status().last_error.clone()
    }

    /// Last `device_register_ack` outcome since the tunnel was opened, if any.
    pub fn ack_status(&self) -> Option<AckRecord> {
        self.read_status().ack.clone()
    }

    /// Notified whenever a heartbeat should run immediately.
    pub fn heartbeat_trigger(&self) -> Arc<Notify> {
        self.heartbeat_trigger.clone()
    }

    pub fn tunnel(&self) -> &Arc<TunnelService> {
        &self.tunnel
    }

    /// Load the persisted record at startup.
    ///
    /// Credentials are restored but the device stays unregistered until a
    /// registration succeeds in this process.
    pub async fn restore(&self, record: DeviceConfig) {
        let _guard = self.transition.lock().await;
        tracing::info!(
            "Restored device record {} (gateway: {})",
            if record.device_id.is_empty() { "<none>" } else { record.device_id.as_str() },
            record.gateway_address
        );
        *self.write_config() = DeviceConfig {
            is_registered: false,
            ..record
        };
        self.set_state(RegistrationState::Unregistered, None);
    }

    /// Register with the gateway. Never fails past this boundary: errors are
    /// reported in the outcome and leave the machine in `RegistrationFailed`,
    /// unless an earlier registration still holds, in which case it stays
    /// `Registered` with the error recorded.
    pub async fn register(&self, credentials: RegistrationCredentials) -> RegistrationOutcome {
        let _guard = self.transition.lock().await;
        self.set_state(RegistrationState::Registering, None);

        match self.try_register(&credentials).await {
            Ok(config) => {
                tracing::info!("Device registration successful: {} ({})", config.device_id, config.device_name);
                self.heartbeat_trigger.notify_one();

                if let Err(e) = self.open_tunnel(&config).await {
                    tracing::warn!("Registered but tunnel could not be opened: {}", e);
                }

                RegistrationOutcome::registered(config.device_id, config.device_name)
            }
            Err(e) => {
                tracing::error!("Registration failed: {}", e);
                let state = if self.read_config().is_registered {
                    RegistrationState::Registered
                } else {
                    RegistrationState::RegistrationFailed
                };
                self.set_state(state, Some(e.to_string()));
                RegistrationOutcome::failed(e.to_string())
            }
        }
    }

    async fn try_register(
        &self,
        credentials: &RegistrationCredentials,
    ) -> Result<DeviceConfig, RegistrationError> {
        validate_credentials(credentials)?;

        let (ip, device_type, device_model) = tokio::join!(
            self.probe.ip_address(),
            self.probe.device_type(),
            self.probe.device_model(),
        );

        let request = RegisterRequest {
            code: credentials.code.clone(),
            gateway_address: credentials.gateway_address.clone(),
            reward_address: credentials.reward_address.clone(),
            device_type,
            gpu_type: device_model,
            ip,
        };

        let response = self
            .gateway
            .register(&credentials.gateway_address, &credentials.key, &request)
            .await
            .map_err(|e| RegistrationError::Network(e.to_string()))?;

        if !response.success {
            return Err(RegistrationError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "Gateway rejected the registration".to_string()),
            ));
        }

        let device_id = response
            .node_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RegistrationError::Rejected("Gateway did not return a node id".to_string()))?;

        let config = DeviceConfig {
            device_name: response.name.unwrap_or_else(|| device_id.clone()),
            device_id,
            gateway_address: credentials.gateway_address.clone(),
            reward_address: credentials.reward_address.clone(),
            key: credentials.key.clone(),
            code: credentials.code.clone(),
            base_path: credentials
                .base_path
                .clone()
                .unwrap_or_else(|| self.default_base_path.clone()),
            is_registered: true,
            timestamp: Some(Utc::now()),
        };

        self.store
            .save_device_config(&config)
            .map_err(|e| RegistrationError::Store(e.to_string()))?;

        *self.write_config() = config.clone();
        self.set_state(RegistrationState::Registered, None);
        Ok(config)
    }

    /// Open the tunnel for `config`, bind the device id and announce the
    /// device to the gateway.
    pub(crate) async fn open_tunnel(&self, config: &DeviceConfig) -> Result<(), TunnelError> {
        self.write_status().ack = None;

        self.tunnel
            .connect(&config.gateway_address, &config.code, &config.base_path)
            .await?;

        let local = PeerId::new(config.device_id.clone());
        self.tunnel.bind(local.clone());

        let payload = serde_json::to_value(DeviceRegisterRequest {
            device_id: config.device_id.clone(),
            device_name: config.device_name.clone(),
            reward_address: config.reward_address.clone(),
            code: config.code.clone(),
        })
        .map_err(|e| TunnelError::InvalidPayload(e.to_string()))?;

        let announce = TunnelMessage::new(DEVICE_REGISTER_REQUEST, local, self.gateway_peer.clone(), payload);
        self.tunnel.dispatch(&announce).await
    }

    /// Forget credentials, close the tunnel and return to `Unregistered`.
    pub async fn unregister(&self) -> RegistrationOutcome {
        let _guard = self.transition.lock().await;

        if let Err(e) = self.store.clear_device_config() {
            tracing::error!("Failed to clear device record: {}", e);
            return RegistrationOutcome::failed(format!("Failed to clear device record: {}", e));
        }

        self.tunnel.reset().await;
        *self.write_config() = DeviceConfig::default();
        {
            let mut status = self.write_status();
            status.state = RegistrationState::Unregistered;
            status.last_error = None;
            status.ack = None;
        }

        tracing::info!("Device unregistered");
        RegistrationOutcome {
            success: true,
            error: None,
            device_id: None,
            device_name: None,
        }
    }

    /// Heartbeat failure policy: the device no longer counts as registered.
    ///
    /// Skipped while a register/unregister transition is running, since that
    /// transition decides the state itself.
    pub fn mark_heartbeat_lost(&self, reason: &str) {
        let Ok(_guard) = self.transition.try_lock() else {
            tracing::debug!("Registration transition in progress, keeping state");
            return;
        };

        let was_registered = {
            let mut config = self.write_config();
            std::mem::replace(&mut config.is_registered, false)
        };
        if was_registered {
            tracing::warn!("Heartbeat failed, device marked unregistered: {}", reason);
            self.set_state(
                RegistrationState::RegistrationFailed,
                Some(format!("Heartbeat failed: {}", reason)),
            );
        }
    }

    fn record_ack(&self, device_id: &str, status: AckStatus, message: Option<String>) {
        let current = self.read_config().device_id.clone();
        if !current.is_empty() && current != device_id {
            tracing::warn!("Ignoring ack for device {} (local device: {})", device_id, current);
            return;
        }
        self.write_status().ack = Some(AckRecord {
            status,
            message,
            received_at: Utc::now(),
        });
    }

    /// Follow tunnel events: record acknowledgments and log link loss.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let machine = self.clone();
        let mut events = self.tunnel.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TunnelEvent::DeviceStatusUpdate {
                        device_id,
                        status,
                        message,
                    }) => machine.record_ack(&device_id, status, message),
                    Ok(TunnelEvent::ConnectionLost { reason }) => {
                        tracing::warn!("Tunnel to gateway lost: {}", reason);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Device event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn validate_credentials(credentials: &RegistrationCredentials) -> Result<(), RegistrationError> {
    let url = Url::parse(&credentials.gateway_address).map_err(|e| {
        RegistrationError::Validation(format!(
            "Invalid gateway address {}: {}",
            credentials.gateway_address, e
        ))
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RegistrationError::Validation(format!(
            "Gateway address must be an http(s) URL: {}",
            credentials.gateway_address
        )));
    }
    if credentials.code.trim().is_empty() {
        return Err(RegistrationError::Validation("Registration code is required".to_string()));
    }
    if credentials.key.trim().is_empty() {
        return Err(RegistrationError::Validation("Gateway key is required".to_string()));
    }
    if credentials.reward_address.trim().is_empty() {
        return Err(RegistrationError::Validation("Reward address is required".to_string()));
    }
    Ok(())
}
