//! Startup registration from persisted credentials.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use super::{DeviceConfig, DeviceRegistrationStateMachine, RegistrationCredentials};
use crate::config::AutoRegistrationConfig;
use crate::store::Store;

/// Operator view of the auto-registration loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRegistrationStatus {
    pub enabled: bool,
    pub is_registering: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Re-registers the device with its stored credentials, retrying with
/// exponential backoff up to `max_retries` attempts.
pub struct AutoRegistrationService {
    registration: Arc<DeviceRegistrationStateMachine>,
    store: Arc<dyn Store>,
    config: AutoRegistrationConfig,
    is_registering: AtomicBool,
    retry_count: AtomicU32,
    last_error: Mutex<Option<String>>,
}

struct RegisteringGuard<'a>(&'a AtomicBool);

impl Drop for RegisteringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AutoRegistrationService {
    pub fn new(
        registration: Arc<DeviceRegistrationStateMachine>,
        store: Arc<dyn Store>,
        config: AutoRegistrationConfig,
    ) -> Self {
        Self {
            registration,
            store,
            config,
            is_registering: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn status(&self) -> AutoRegistrationStatus {
        AutoRegistrationStatus {
            enabled: self.config.enabled,
            is_registering: self.is_registering.load(Ordering::SeqCst),
            retry_count: self.retry_count.load(Ordering::SeqCst),
            max_retries: self.config.max_retries,
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }

    /// Clear the retry budget so the next `run` may try again.
    pub fn reset(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = None;
        }
    }

    /// Persisted record, if it carries everything needed to register.
    pub fn stored_credentials(&self) -> Option<DeviceConfig> {
        match self.store.load_device_config() {
            Ok(record) => record.filter(|r| r.has_registration_info()),
            Err(e) => {
                tracing::error!("Failed to load device record: {}", e);
                None
            }
        }
    }

    /// Delay before the retry following failed attempt number `attempt` (0-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay_secs;
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let secs = base
            .saturating_mul(factor)
            .min(self.config.max_retry_delay_secs);
        Duration::from_secs(secs)
    }

    /// Register with stored credentials until it succeeds or the retry budget
    /// is spent. Returns whether the device ended up registered.
    pub async fn run(&self) -> bool {
        if !self.config.enabled {
            tracing::info!("Auto-registration disabled");
            return false;
        }

        let Some(record) = self.stored_credentials() else {
            tracing::info!("No stored registration info, waiting for manual registration");
            return false;
        };

        if self.is_registering.swap(true, Ordering::SeqCst) {
            tracing::debug!("Auto-registration already running");
            return false;
        }
        let _guard = RegisteringGuard(&self.is_registering);

        let credentials = RegistrationCredentials {
            code: record.code.clone(),
            gateway_address: record.gateway_address.clone(),
            reward_address: record.reward_address.clone(),
            key: record.key.clone(),
            base_path: Some(record.base_path.clone()).filter(|p| !p.is_empty()),
        };

        loop {
            if self.registration.is_registered() {
                return true;
            }

            let attempts = self.retry_count.load(Ordering::SeqCst);
            if attempts >= self.config.max_retries {
                tracing::error!(
                    "Auto-registration stopped after {} attempts, reinitialize to retry",
                    attempts
                );
                return false;
            }

            tracing::info!(
                "Auto-registering with {} (attempt {}/{})",
                credentials.gateway_address,
                attempts + 1,
                self.config.max_retries
            );

            let outcome = self.registration.register(credentials.clone()).await;
            if outcome.success {
                tracing::info!("Auto-registration successful");
                self.reset();
                return true;
            }

            let failed = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            tracing::warn!("Auto-registration attempt {} failed: {}", failed, error);
            if let Ok(mut last_error) = self.last_error.lock() {
                *last_error = Some(error);
            }

            if failed < self.config.max_retries {
                let delay = self.retry_delay(failed - 1);
                tracing::info!("Retrying auto-registration in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
