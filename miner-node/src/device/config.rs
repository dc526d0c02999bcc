//! Device identity and gateway credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide device configuration.
///
/// Only [`DeviceRegistrationStateMachine`](super::DeviceRegistrationStateMachine)
/// mutates the live instance; everything else works on snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_name: String,
    pub gateway_address: String,
    pub reward_address: String,
    pub key: String,
    pub code: String,
    pub base_path: String,
    pub is_registered: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DeviceConfig {
    /// Whether enough credentials are stored to register without operator input.
    pub fn has_registration_info(&self) -> bool {
        !self.gateway_address.is_empty()
            && !self.key.is_empty()
            && !self.code.is_empty()
            && !self.reward_address.is_empty()
            && !self.device_name.is_empty()
    }

    /// Copy with the gateway key blanked, for status endpoints and logs.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.key.is_empty() {
            copy.key = "***".to_string();
        }
        copy
    }
}

/// Online state of a device as recorded by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(DeviceStatus::Online),
            "offline" => Some(DeviceStatus::Offline),
            _ => None,
        }
    }
}

/// Stored status row for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusRecord {
    pub device_id: String,
    pub name: String,
    pub status: DeviceStatus,
    pub reward_address: String,
    pub gateway_address: String,
    pub updated_at: DateTime<Utc>,
}
