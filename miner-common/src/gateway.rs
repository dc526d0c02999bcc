//! Gateway HTTP request/response bodies.

use serde::{Deserialize, Serialize};

/// Body of `POST {gateway}/node/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub code: String,
    pub gateway_address: String,
    pub reward_address: String,
    pub device_type: String,
    pub gpu_type: String,
    pub ip: String,
}

/// Registration result reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// The gateway answers either with a bare [`RegisterResponse`] or wrapped in
/// `{ data, code }` where `code` mirrors an HTTP status.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegisterReply {
    Enveloped { data: RegisterResponse, code: u16 },
    Plain(RegisterResponse),
}

impl RegisterReply {
    /// Embedded status code, if the gateway sent one.
    pub fn code(&self) -> Option<u16> {
        match self {
            RegisterReply::Enveloped { code, .. } => Some(*code),
            RegisterReply::Plain(_) => None,
        }
    }

    pub fn into_response(self) -> RegisterResponse {
        match self {
            RegisterReply::Enveloped { data, .. } => data,
            RegisterReply::Plain(data) => data,
        }
    }
}

/// Body of `POST {gateway}/node/heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub code: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub gpu_usage: f64,
    pub ip: String,
    /// RFC 3339 timestamp of the report.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub model: String,
    /// JSON-encoded host description (os, cpu, memory, graphics).
    pub device_info: String,
    pub gateway_url: String,
}
