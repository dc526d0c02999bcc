//! Periodic liveness report to the gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use miner_common::HeartbeatRequest;

use super::{DeviceConfig, DeviceRegistrationStateMachine, DeviceStatus, GatewayApi, SystemProbe};
use crate::engine::InferenceEngine;
use crate::store::Store;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Device not registered, nothing sent.
    NotRegistered,
    /// A previous tick was still running.
    Overlapping,
    Sent,
    Failed,
}

/// Sends a heartbeat every `interval` while the device is registered, and
/// immediately whenever the registration machine asks for one.
pub struct HeartbeatScheduler {
    registration: Arc<DeviceRegistrationStateMachine>,
    gateway: Arc<dyn GatewayApi>,
    engine: Arc<dyn InferenceEngine>,
    probe: Arc<dyn SystemProbe>,
    store: Arc<dyn Store>,
    interval: Duration,
    inactive_threshold: Duration,
    in_flight: AtomicBool,
    engine_online: Mutex<Option<bool>>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Running heartbeat loop. Dropping the handle stops it.
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl HeartbeatScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration: Arc<DeviceRegistrationStateMachine>,
        gateway: Arc<dyn GatewayApi>,
        engine: Arc<dyn InferenceEngine>,
        probe: Arc<dyn SystemProbe>,
        store: Arc<dyn Store>,
        interval: Duration,
        inactive_threshold: Duration,
    ) -> Self {
        Self {
            registration,
            gateway,
            engine,
            probe,
            store,
            interval,
            inactive_threshold,
            in_flight: AtomicBool::new(false),
            engine_online: Mutex::new(None),
        }
    }

    /// Spawn the loop. Ticks run as their own tasks so a slow gateway never
    /// delays the schedule; overlapping ticks are skipped by [`tick`](Self::tick).
    pub fn start(self: Arc<Self>) -> HeartbeatHandle {
        let trigger = self.registration.heartbeat_trigger();
        tracing::info!("Heartbeat started (every {:?})", self.interval);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {
                        tracing::debug!("Heartbeat requested");
                    }
                }

                while ticks.try_join_next().is_some() {}
                let scheduler = self.clone();
                ticks.spawn(async move {
                    scheduler.tick().await;
                });
            }
        });

        HeartbeatHandle { task }
    }

    /// Run one heartbeat. Never fails: an unreachable engine or a gateway
    /// error triggers the failure policy and is reported in the outcome.
    pub async fn tick(&self) -> TickOutcome {
        let config = self.registration.current_config();
        if !config.is_registered {
            tracing::debug!("Device not registered, skipping heartbeat");
            return TickOutcome::NotRegistered;
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("Previous heartbeat still running, skipping");
            return TickOutcome::Overlapping;
        }
        let _guard = InFlightGuard(&self.in_flight);

        if !self.check_engine().await {
            let reason = format!("{} engine unreachable", self.engine.engine_type());
            tracing::error!("Heartbeat failed: {}", reason);
            self.registration.mark_heartbeat_lost(&reason);
            self.mark_inactive_offline();
            return TickOutcome::Failed;
        }
        let request = self.build_request(&config).await;

        match self
            .gateway
            .heartbeat(&config.gateway_address, &config.key, &request)
            .await
        {
            Ok(()) => {
                tracing::debug!("Heartbeat sent to {}", config.gateway_address);
                if let Err(e) = self.store.update_device_status(
                    &config.device_id,
                    &config.device_name,
                    DeviceStatus::Online,
                    &config.reward_address,
                    &config.gateway_address,
                ) {
                    tracing::error!("Failed to record device status: {}", e);
                }
                TickOutcome::Sent
            }
            Err(e) => {
                tracing::error!("Heartbeat failed: {}", e);
                self.registration.mark_heartbeat_lost(&e.to_string());
                self.mark_inactive_offline();
                TickOutcome::Failed
            }
        }
    }

    async fn build_request(&self, config: &DeviceConfig) -> HeartbeatRequest {
        let snapshot = self.probe.snapshot().await;
        HeartbeatRequest {
            code: config.code.clone(),
            cpu_usage: snapshot.cpu_usage,
            memory_usage: snapshot.memory_usage,
            gpu_usage: snapshot.gpu_usage,
            ip: snapshot.ip,
            timestamp: Utc::now().to_rfc3339(),
            device_type: snapshot.device_type,
            model: snapshot.device_model,
            device_info: snapshot.device_info,
            gateway_url: config.gateway_address.clone(),
        }
    }

    fn mark_inactive_offline(&self) {
        let threshold = chrono::Duration::from_std(self.inactive_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        match self.store.mark_devices_offline(Utc::now() - threshold) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Marked {} inactive devices offline", n),
            Err(e) => tracing::error!("Failed to mark inactive devices offline: {}", e),
        }
    }

    async fn check_engine(&self) -> bool {
        let online = match self.engine.health_check().await {
            Ok(health) => health.is_healthy,
            Err(e) => {
                tracing::debug!("Engine health check failed: {}", e);
                false
            }
        };
        self.record_engine_status(online);
        online
    }

    /// Log engine availability transitions. Returns whether the status changed.
    fn record_engine_status(&self, online: bool) -> bool {
        let Ok(mut last) = self.engine_online.lock() else {
            return false;
        };
        if *last == Some(online) {
            return false;
        }
        if online {
            tracing::info!("{} engine is online", self.engine.engine_type());
        } else {
            tracing::warn!("{} engine is offline", self.engine.engine_type());
        }
        *last = Some(online);
        true
    }
}
