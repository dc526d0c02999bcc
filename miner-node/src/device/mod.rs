//! Device identity, gateway registration and liveness.

mod auto_register;
mod config;
mod gateway_client;
mod heartbeat;
mod registration;
mod system;

pub use auto_register::{AutoRegistrationService, AutoRegistrationStatus};
pub use config::{DeviceConfig, DeviceStatus, DeviceStatusRecord};
pub use gateway_client::{GatewayApi, GatewayError, HttpGatewayClient};
pub use heartbeat::{HeartbeatHandle, HeartbeatScheduler, TickOutcome};
pub use registration::{
    AckRecord, DeviceRegistrationStateMachine, RegistrationCredentials, RegistrationError,
    RegistrationOutcome, RegistrationState,
};
pub use system::{HostProbe, HostSnapshot, SystemProbe};
