//! Built-in tunnel message handlers.

use std::sync::Arc;

use async_trait::async_trait;

use miner_common::protocol::{DEVICE_REGISTER_ACK, DEVICE_REGISTER_REQUEST, PING, PONG};
use miner_common::{DeviceRegisterAck, TunnelMessage};

use super::{AckStatus, Direction, HandlerContext, HandlerRegistry, MessageHandler, TunnelError, TunnelEvent};

/// Handler table the node boots with.
pub fn default_registry() -> Result<HandlerRegistry, TunnelError> {
    let mut registry = HandlerRegistry::new();
    registry.register(DEVICE_REGISTER_ACK, Direction::Income, Arc::new(DeviceRegisterAckHandler))?;
    registry.register(PING, Direction::Income, Arc::new(PingHandler))?;
    registry.register(DEVICE_REGISTER_REQUEST, Direction::Outcome, Arc::new(ForwardToGatewayHandler))?;
    registry.register(PONG, Direction::Outcome, Arc::new(ForwardToGatewayHandler))?;
    Ok(registry)
}

/// Turns the gateway's tunnel-level acknowledgment into a status update event.
pub struct DeviceRegisterAckHandler;

#[async_trait]
impl MessageHandler for DeviceRegisterAckHandler {
    async fn handle(&self, message: &TunnelMessage, ctx: &HandlerContext) -> Result<(), TunnelError> {
        let ack: DeviceRegisterAck = serde_json::from_value(message.payload.clone())
            .map_err(|e| TunnelError::InvalidPayload(format!("device_register_ack: {}", e)))?;

        let (status, detail) = if ack.success {
            tracing::info!("Gateway confirmed registration of device {}", ack.device_id);
            (AckStatus::Connected, ack.message)
        } else {
            let reason = ack.error.or(ack.message);
            tracing::error!(
                "Gateway rejected registration of device {}: {}",
                ack.device_id,
                reason.as_deref().unwrap_or("no reason given")
            );
            (AckStatus::Failed, reason)
        };

        ctx.events.emit(TunnelEvent::DeviceStatusUpdate {
            device_id: ack.device_id,
            status,
            message: detail,
        });
        Ok(())
    }
}

/// Answers a gateway `ping` with a `pong` carrying the same payload.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, message: &TunnelMessage, ctx: &HandlerContext) -> Result<(), TunnelError> {
        let Some(local) = ctx.identity.get() else {
            return Err(TunnelError::Connection("Node identity is not bound".to_string()));
        };
        let pong = TunnelMessage::new(PONG, local, message.from.clone(), message.payload.clone());
        ctx.enqueue(pong)
    }
}

/// Writes an outcome message to the gateway.
pub struct ForwardToGatewayHandler;

#[async_trait]
impl MessageHandler for ForwardToGatewayHandler {
    async fn handle(&self, message: &TunnelMessage, ctx: &HandlerContext) -> Result<(), TunnelError> {
        ctx.send(message).await
    }
}
