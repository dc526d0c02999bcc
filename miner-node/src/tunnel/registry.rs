//! Handler registry keyed by message type and direction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use miner_common::TunnelMessage;

use super::{ConnectionManager, Direction, EventBus, NodeIdentity, TunnelError, TunnelEvent};

/// Everything a handler may touch while processing a message.
#[derive(Clone)]
pub struct HandlerContext {
    pub identity: NodeIdentity,
    pub connection: Arc<ConnectionManager>,
    pub events: EventBus,
    /// Messages pushed here are dispatched by the tunnel pump as outcome
    /// messages, after the current message has been handled.
    pub outbound: mpsc::UnboundedSender<TunnelMessage>,
}

impl HandlerContext {
    /// Write a message to the gateway, publishing `MessageSent` or `MessageFailed`.
    pub async fn send(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        match self.connection.send(message).await {
            Ok(()) => {
                self.events.emit(TunnelEvent::MessageSent(message.clone()));
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to send {} message: {}", message.message_type, e);
                self.events.emit(TunnelEvent::MessageFailed {
                    message: message.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Queue a message for outcome dispatch by the tunnel pump.
    pub fn enqueue(&self, message: TunnelMessage) -> Result<(), TunnelError> {
        self.outbound
            .send(message)
            .map_err(|_| TunnelError::MessageSend("Tunnel pump stopped".to_string()))
    }
}

/// Logic for exactly one `(message type, direction)` pair.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &TunnelMessage, ctx: &HandlerContext) -> Result<(), TunnelError>;
}

/// Startup-time table of message handlers.
///
/// Built with `&mut self` while the node boots, then shared read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, Direction), Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler. Fails if the pair is already bound.
    pub fn register(
        &mut self,
        message_type: &str,
        direction: Direction,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TunnelError> {
        let key = (message_type.to_string(), direction);
        if self.handlers.contains_key(&key) {
            return Err(TunnelError::DuplicateHandler {
                message_type: message_type.to_string(),
                direction,
            });
        }
        tracing::debug!("Registered {} handler for {}", direction, message_type);
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, message_type: &str, direction: Direction) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .get(&(message_type.to_string(), direction))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _: &TunnelMessage, _: &HandlerContext) -> Result<(), TunnelError> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("ping", Direction::Income, Arc::new(Noop))
            .unwrap();

        let err = registry
            .register("ping", Direction::Income, Arc::new(Noop))
            .unwrap_err();
        assert_eq!(
            err,
            TunnelError::DuplicateHandler {
                message_type: "ping".to_string(),
                direction: Direction::Income,
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_type_different_direction() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("pong", Direction::Income, Arc::new(Noop))
            .unwrap();
        registry
            .register("pong", Direction::Outcome, Arc::new(Noop))
            .unwrap();

        assert!(registry.get("pong", Direction::Income).is_some());
        assert!(registry.get("pong", Direction::Outcome).is_some());
        assert!(registry.get("ping", Direction::Income).is_none());
    }
}
