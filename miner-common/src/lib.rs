//! Miner Common Types
//!
//! Shared types used by the miner node and gateway-side tooling.

pub mod gateway;
pub mod protocol;
pub mod task;

pub use gateway::{HeartbeatRequest, RegisterReply, RegisterRequest, RegisterResponse};
pub use protocol::{DeviceRegisterAck, DeviceRegisterRequest, PeerId, TunnelMessage};
pub use task::{EarningsRecord, EarningsSummary, TaskHistory, TaskMetrics, TaskRecord, TaskStatus};
