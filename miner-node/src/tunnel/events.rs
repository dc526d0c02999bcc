use serde::Serialize;
use tokio::sync::broadcast;

use miner_common::{PeerId, TunnelMessage};

/// Outcome of the gateway's tunnel-level registration acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Connected,
    Failed,
}

/// Lifecycle events published by the tunnel layer.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    MessageReceived(TunnelMessage),
    MessageSent(TunnelMessage),
    MessageFailed {
        message: TunnelMessage,
        error: String,
    },
    ConnectionEstablished {
        gateway_url: String,
    },
    ConnectionLost {
        reason: String,
    },
    DeviceRegistered {
        peer_id: PeerId,
    },
    DeviceStatusUpdate {
        device_id: String,
        status: AckStatus,
        message: Option<String>,
    },
}

/// Broadcast channel for [`TunnelEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn emit(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
