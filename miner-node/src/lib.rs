//! Miner node: registers with a gateway, keeps the tunnel open, reports
//! liveness and proxies inference jobs to the local engine.

pub mod api;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod logging;
pub mod startup;
pub mod state;
pub mod store;
pub mod task;
pub mod test_util;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, StartupError};
pub use state::{AppState, Services};
