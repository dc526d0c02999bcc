//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::device::{
    AutoRegistrationService, DeviceRegistrationStateMachine, GatewayApi, HeartbeatScheduler,
    HostProbe, HttpGatewayClient, SystemProbe,
};
use crate::engine::{InferenceEngine, OllamaEngine};
use crate::error::StartupError;
use crate::store::{SqliteStore, Store};
use crate::task::{RandomBlockReward, RewardPolicy, TaskLifecycleTracker};
use crate::tunnel::{default_registry, Transport, TunnelService, WebSocketTransport};

/// Collaborators the node talks to. Swapped for fakes in tests.
pub struct Services {
    pub gateway: Arc<dyn GatewayApi>,
    pub engine: Arc<dyn InferenceEngine>,
    pub probe: Arc<dyn SystemProbe>,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub rewards: Arc<dyn RewardPolicy>,
}

impl Services {
    /// Production services described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let connect_timeout = Duration::from_secs(config.gateway.connect_timeout_secs);
        let request_timeout = Duration::from_secs(config.gateway.request_timeout_secs);

        Ok(Self {
            gateway: Arc::new(HttpGatewayClient::new(connect_timeout, request_timeout)?),
            engine: Arc::new(OllamaEngine::new(
                &config.ollama.base_url,
                Duration::from_secs(config.ollama.probe_timeout_secs),
            )),
            probe: Arc::new(HostProbe::new(&config.node.device_type, &config.node.gpu_model)),
            store: Arc::new(SqliteStore::new(&config.database.url)?),
            transport: Arc::new(WebSocketTransport::new(connect_timeout)),
            rewards: Arc::new(RandomBlockReward::new(
                config.rewards.block_reward_min,
                config.rewards.block_reward_max,
            )),
        })
    }
}

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub engine: Arc<dyn InferenceEngine>,
    pub tunnel: Arc<TunnelService>,
    pub registration: Arc<DeviceRegistrationStateMachine>,
    pub auto_registration: Arc<AutoRegistrationService>,
    pub heartbeat: Arc<HeartbeatScheduler>,
    pub tasks: Arc<TaskLifecycleTracker>,
}

impl AppState {
    /// Wire every component. Spawns the tunnel pump, so it must run inside a
    /// tokio runtime. A conflicting handler table aborts startup.
    pub fn build(config: Config, services: Services) -> Result<Arc<Self>, StartupError> {
        let tunnel = TunnelService::start(default_registry()?, services.transport);

        let registration = Arc::new(DeviceRegistrationStateMachine::new(
            &config.gateway,
            services.gateway.clone(),
            services.probe.clone(),
            tunnel.clone(),
            services.store.clone(),
        ));
        let auto_registration = Arc::new(AutoRegistrationService::new(
            registration.clone(),
            services.store.clone(),
            config.auto_registration.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatScheduler::new(
            registration.clone(),
            services.gateway,
            services.engine.clone(),
            services.probe,
            services.store.clone(),
            Duration::from_secs(config.gateway.heartbeat_interval_secs),
            Duration::from_secs(config.gateway.inactive_threshold_secs),
        ));
        let tasks = Arc::new(TaskLifecycleTracker::new(
            services.store.clone(),
            services.engine.clone(),
            services.rewards,
        ));

        Ok(Arc::new(Self {
            config,
            store: services.store,
            engine: services.engine,
            tunnel,
            registration,
            auto_registration,
            heartbeat,
            tasks,
        }))
    }
}
