//! Tunnel communication layer.
//!
//! The tunnel is the persistent channel between this node and its gateway.
//! It is split into:
//!
//! - [`HandlerRegistry`]: startup-time table of `(type, direction)` handlers
//! - [`MessageRouter`]: classifies messages, runs listeners, dispatches handlers
//! - [`ConnectionManager`]: owns the transport link and the local identity
//! - [`TunnelService`]: wires the three together and pumps inbound frames
//!
//! Lifecycle notifications are published as [`TunnelEvent`]s on an
//! [`EventBus`] rather than through name-keyed callbacks.

mod connection;
mod events;
mod handlers;
mod registry;
mod router;
mod service;
mod transport;

pub use connection::{ConnectionManager, ConnectionPhase, ConnectionState};
pub use events::{AckStatus, EventBus, TunnelEvent};
pub use handlers::{
    default_registry, DeviceRegisterAckHandler, ForwardToGatewayHandler, PingHandler,
};
pub use registry::{HandlerContext, HandlerRegistry, MessageHandler};
pub use router::{Listener, MessageRouter};
pub use service::TunnelService;
pub use transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};

use std::fmt;
use std::sync::{Arc, RwLock};

use miner_common::PeerId;

/// Which side of the node a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Addressed to the local peer.
    Income,
    /// Sent by the local peer.
    Outcome,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Income => f.write_str("income"),
            Direction::Outcome => f.write_str("outcome"),
        }
    }
}

/// Errors raised by the tunnel layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TunnelError {
    #[error("Handler already registered for {message_type} ({direction})")]
    DuplicateHandler {
        message_type: String,
        direction: Direction,
    },

    #[error("No handler for message type {message_type} ({direction})")]
    UnknownMessageType {
        message_type: String,
        direction: Direction,
    },

    #[error("Failed to send message: {0}")]
    MessageSend(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Local peer identity, shared between the connection manager, the router
/// and handlers. Unset until the node is bound after registration.
#[derive(Debug, Clone, Default)]
pub struct NodeIdentity {
    inner: Arc<RwLock<Option<PeerId>>>,
}

impl NodeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<PeerId> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }

    pub(crate) fn set(&self, peer_id: PeerId) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(peer_id);
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_set_and_clear() {
        let identity = NodeIdentity::new();
        assert!(identity.get().is_none());

        let shared = identity.clone();
        shared.set(PeerId::from("dev-1"));
        assert_eq!(identity.get(), Some(PeerId::from("dev-1")));

        identity.clear();
        assert!(shared.get().is_none());
    }

    #[test]
    fn test_error_messages_name_direction() {
        let err = TunnelError::UnknownMessageType {
            message_type: "foo".to_string(),
            direction: Direction::Income,
        };
        assert_eq!(err.to_string(), "No handler for message type foo (income)");
    }
}
