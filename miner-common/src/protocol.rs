//! Tunnel protocol types for node-gateway communication.
//!
//! Every frame exchanged over the tunnel is a JSON-encoded [`TunnelMessage`].
//! The `type` field selects the handler on the receiving side, `from`/`to`
//! carry peer identities and `payload` is type-specific.
//!
//! # Connection Flow
//!
//! 1. Node registers over HTTP (`POST {gateway}/node/register`) and learns its device id
//! 2. Node opens the tunnel and binds its device id as local peer id
//! 3. Node sends `device_register_request` through the tunnel
//! 4. Gateway answers with `device_register_ack` (success or failure)
//! 5. Gateway may send `ping`, node answers with `pong`
//!
//! # Direction
//!
//! A message is *income* when it is addressed to the local peer and *outcome*
//! when the local peer is its sender. Handlers are bound per `(type, direction)`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message type sent by the gateway to confirm tunnel-level registration.
pub const DEVICE_REGISTER_ACK: &str = "device_register_ack";
/// Message type sent by the node after the tunnel is bound.
pub const DEVICE_REGISTER_REQUEST: &str = "device_register_request";
/// Application-level liveness probe from the gateway.
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Stable identifier of a node within the tunnel network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A single tunnel frame. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub from: PeerId,
    pub to: PeerId,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TunnelMessage {
    /// Build a message stamped with the current time.
    pub fn new(
        message_type: impl Into<String>,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            from,
            to,
            payload,
            timestamp: Some(Utc::now()),
        }
    }

    /// A message whose sender is also its recipient.
    pub fn is_loopback(&self) -> bool {
        self.from == self.to
    }

    /// Identity tuple of the message.
    pub fn key(&self) -> (&str, &PeerId, &PeerId, Option<DateTime<Utc>>) {
        (&self.message_type, &self.from, &self.to, self.timestamp)
    }
}

/// Payload of a `device_register_ack` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegisterAck {
    pub success: bool,
    pub device_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of a `device_register_request` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegisterRequest {
    pub device_id: String,
    pub device_name: String,
    pub reward_address: String,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tunnel_message_serialization() {
        let msg = TunnelMessage::new(PING, "gateway".into(), "dev-1".into(), json!({"n": 1}));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ping""#));
        assert!(json.contains(r#""from":"gateway""#));
        assert!(json.contains(r#""to":"dev-1""#));
    }

    #[test]
    fn test_tunnel_message_without_timestamp() {
        let json = r#"{"type":"pong","from":"a","to":"b","payload":{}}"#;
        let msg: TunnelMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message_type, PONG);
        assert!(msg.timestamp.is_none());
        assert!(!msg.is_loopback());
    }

    #[test]
    fn test_tunnel_message_missing_payload_defaults_to_null() {
        let json = r#"{"type":"ping","from":"a","to":"b"}"#;
        let msg: TunnelMessage = serde_json::from_str(json).unwrap();
        assert!(msg.payload.is_null());
    }

    #[test]
    fn test_loopback_detection() {
        let msg = TunnelMessage::new(PING, "dev-1".into(), "dev-1".into(), json!({}));
        assert!(msg.is_loopback());
    }

    #[test]
    fn test_device_register_ack_camel_case() {
        let ack: DeviceRegisterAck = serde_json::from_value(json!({
            "success": false,
            "deviceId": "dev-9",
            "error": "bad code"
        }))
        .unwrap();
        assert!(!ack.success);
        assert_eq!(ack.device_id, "dev-9");
        assert_eq!(ack.error.as_deref(), Some("bad code"));
        assert!(ack.message.is_none());
    }

    #[test]
    fn test_peer_id_display() {
        let peer = PeerId::new("node-42");
        assert_eq!(peer.to_string(), "node-42");
        assert_eq!(serde_json::to_string(&peer).unwrap(), r#""node-42""#);
    }
}
