//! Wiring of registry, router and connection manager plus the inbound pump.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use miner_common::{PeerId, TunnelMessage};

use super::{
    ConnectionManager, ConnectionState, EventBus, HandlerContext, HandlerRegistry, Listener,
    MessageRouter, NodeIdentity, Transport, TransportEvent, TunnelError, TunnelEvent,
};

/// The tunnel as seen by the rest of the node.
///
/// Frames from the transport and messages queued by handlers are dispatched
/// one at a time, in arrival order, by a single pump task.
pub struct TunnelService {
    router: Arc<MessageRouter>,
    connection: Arc<ConnectionManager>,
    events: EventBus,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelService {
    /// Build the tunnel and spawn its pump. Must be called inside a tokio runtime.
    pub fn start(registry: HandlerRegistry, transport: Arc<dyn Transport>) -> Arc<Self> {
        let identity = NodeIdentity::new();
        let events = EventBus::default();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(ConnectionManager::new(
            transport,
            identity.clone(),
            events.clone(),
            inbound_tx,
        ));
        let ctx = HandlerContext {
            identity,
            connection: connection.clone(),
            events: events.clone(),
            outbound: outbound_tx,
        };
        let router = Arc::new(MessageRouter::new(Arc::new(registry), ctx));

        let pump = tokio::spawn(run_pump(
            router.clone(),
            connection.clone(),
            inbound_rx,
            outbound_rx,
        ));

        Arc::new(Self {
            router,
            connection,
            events,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.router.context().identity.get()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn connect(
        &self,
        gateway_address: &str,
        code: &str,
        base_path: &str,
    ) -> Result<(), TunnelError> {
        self.connection.connect(gateway_address, code, base_path).await
    }

    pub fn bind(&self, peer_id: PeerId) {
        self.connection.bind(peer_id);
    }

    /// Close the link and drop every pending listener.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.router.clear_listeners();
    }

    /// Close the link and forget the local identity.
    pub async fn reset(&self) {
        self.disconnect().await;
        self.connection.unbind();
    }

    pub async fn dispatch(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        self.router.dispatch(message).await
    }

    pub async fn dispatch_with_listener(
        &self,
        message: &TunnelMessage,
        listener: Listener,
    ) -> Result<(), TunnelError> {
        self.router.dispatch_with_listener(message, listener).await
    }
}

impl Drop for TunnelService {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().ok().and_then(|mut guard| guard.take()) {
            pump.abort();
        }
    }
}

async fn run_pump(
    router: Arc<MessageRouter>,
    connection: Arc<ConnectionManager>,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<TunnelMessage>,
) {
    loop {
        tokio::select! {
            Some(event) = inbound.recv() => match event {
                TransportEvent::Message(message) => {
                    connection.note_peer(&message.from);
                    if let Err(e) = router.dispatch(&message).await {
                        tracing::error!("Failed to handle {} message: {}", message.message_type, e);
                    }
                }
                TransportEvent::Closed { link_id, reason } => {
                    connection.link_closed(link_id, &reason);
                }
            },

            Some(message) = outbound.recv() => {
                if let Err(e) = router.dispatch(&message).await {
                    tracing::error!("Failed to send {} message: {}", message.message_type, e);
                }
            }

            else => break,
        }
    }
    tracing::debug!("Tunnel pump stopped");
}
