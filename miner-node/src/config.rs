//! Configuration for the miner node.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the miner node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub auto_registration: AutoRegistrationConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Static description of this machine, reported to the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default = "default_gpu_model")]
    pub gpu_model: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_type: default_device_type(),
            gpu_model: default_gpu_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Gateway connection and heartbeat settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Peer id the gateway uses inside the tunnel.
    #[serde(default = "default_gateway_peer_id")]
    pub peer_id: String,
    /// Tunnel path appended to the gateway host when none was given at registration.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Devices silent for longer than this are marked offline after a failed heartbeat.
    #[serde(default = "default_inactive_threshold")]
    pub inactive_threshold_secs: u64,
    #[serde(default = "default_tunnel_wait")]
    pub tunnel_wait_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            peer_id: default_gateway_peer_id(),
            base_path: default_base_path(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            inactive_threshold_secs: default_inactive_threshold(),
            tunnel_wait_secs: default_tunnel_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoRegistrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
}

impl Default for AutoRegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
        }
    }
}

/// Bounds of the randomized block reward credited per completed task.
#[derive(Debug, Clone, Deserialize)]
pub struct RewardsConfig {
    #[serde(default = "default_block_reward_min")]
    pub block_reward_min: u64,
    #[serde(default = "default_block_reward_max")]
    pub block_reward_max: u64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            block_reward_min: default_block_reward_min(),
            block_reward_max: default_block_reward_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_device_type() -> String {
    std::env::consts::OS.to_string()
}
fn default_gpu_model() -> String {
    "unknown".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8716
}
fn default_gateway_peer_id() -> String {
    "gateway".to_string()
}
fn default_base_path() -> String {
    "/".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_inactive_threshold() -> u64 {
    60
}
fn default_tunnel_wait() -> u64 {
    10
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_probe_timeout() -> u64 {
    20
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    10
}
fn default_max_retry_delay() -> u64 {
    300
}
fn default_block_reward_min() -> u64 {
    1
}
fn default_block_reward_max() -> u64 {
    100
}
fn default_database_url() -> String {
    "sqlite:data/miner.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            api: ApiConfig::default(),
            gateway: GatewayConfig::default(),
            ollama: OllamaConfig::default(),
            auto_registration: AutoRegistrationConfig::default(),
            rewards: RewardsConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (MINER__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .set_default("gateway.heartbeat_interval_secs", default_heartbeat_interval() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("MINER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rewards.block_reward_min > self.rewards.block_reward_max {
            return Err(ConfigError::Message(format!(
                "rewards.block_reward_min ({}) exceeds rewards.block_reward_max ({})",
                self.rewards.block_reward_min, self.rewards.block_reward_max
            )));
        }
        if self.gateway.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Message(
                "gateway.heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
