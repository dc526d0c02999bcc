//! Connection lifecycle of the tunnel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use tokio::sync::mpsc;

use miner_common::{PeerId, TunnelMessage};

use super::{EventBus, NodeIdentity, Transport, TransportEvent, TransportLink, TunnelError, TunnelEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Phase of the tunnel link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Observed snapshot of the connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connected: bool,
    pub phase: ConnectionPhase,
    pub peer_id: Option<PeerId>,
    pub gateway_url: Option<String>,
}

struct Inner {
    phase: ConnectionPhase,
    gateway_url: Option<String>,
    link: Option<(u64, Arc<dyn TransportLink>)>,
    connected_devices: HashSet<PeerId>,
}

/// Owns the transport link to the gateway and the local identity.
///
/// Reconnecting is the caller's job: a link that drops leaves the manager
/// `Disconnected` until `connect` is called again.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    identity: NodeIdentity,
    events: EventBus,
    inbound: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<Inner>,
    connect_lock: tokio::sync::Mutex<()>,
    next_link_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: NodeIdentity,
        events: EventBus,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            transport,
            identity,
            events,
            inbound,
            inner: Mutex::new(Inner {
                phase: ConnectionPhase::Disconnected,
                gateway_url: None,
                link: None,
                connected_devices: HashSet::new(),
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            next_link_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner holds plain data, a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the tunnel to `gateway_address`.
    ///
    /// When a link is already open only the recorded gateway URL changes.
    pub async fn connect(
        &self,
        gateway_address: &str,
        code: &str,
        base_path: &str,
    ) -> Result<(), TunnelError> {
        let endpoint = tunnel_endpoint(gateway_address, code, base_path)?;
        let _guard = self.connect_lock.lock().await;

        {
            let mut inner = self.lock();
            inner.gateway_url = Some(gateway_address.to_string());
            if inner.phase == ConnectionPhase::Connected {
                tracing::info!("Tunnel already open, gateway URL set to {}", gateway_address);
                return Ok(());
            }
            inner.phase = ConnectionPhase::Connecting;
        }

        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("Opening tunnel to {}", endpoint);

        match self.transport.open(&endpoint, link_id, self.inbound.clone()).await {
            Ok(link) => {
                {
                    let mut inner = self.lock();
                    inner.phase = ConnectionPhase::Connected;
                    inner.link = Some((link_id, link));
                }
                self.events.emit(TunnelEvent::ConnectionEstablished {
                    gateway_url: gateway_address.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.lock().phase = ConnectionPhase::Disconnected;
                tracing::warn!("Failed to open tunnel to {}: {}", endpoint, e);
                Err(e)
            }
        }
    }

    /// Assign the local identity after registration.
    pub fn bind(&self, peer_id: PeerId) {
        tracing::info!("Tunnel bound to device {}", peer_id);
        self.identity.set(peer_id.clone());
        self.events.emit(TunnelEvent::DeviceRegistered { peer_id });
    }

    /// Forget the local identity.
    pub fn unbind(&self) {
        self.identity.clear();
    }

    pub async fn send(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        let link = self.lock().link.as_ref().map(|(_, link)| link.clone());
        let Some(link) = link else {
            return Err(TunnelError::MessageSend("Tunnel is not connected".to_string()));
        };

        link.send(message).await.map_err(|e| match e {
            TunnelError::MessageSend(reason) => TunnelError::MessageSend(reason),
            other => TunnelError::MessageSend(other.to_string()),
        })
    }

    /// Tear the link down and clear transient state.
    pub async fn disconnect(&self) {
        let link = {
            let mut inner = self.lock();
            inner.phase = ConnectionPhase::Disconnected;
            inner.connected_devices.clear();
            inner.link.take()
        };

        if let Some((_, link)) = link {
            link.close().await;
        }

        tracing::info!("Tunnel disconnected");
        self.events.emit(TunnelEvent::ConnectionLost {
            reason: "Manual disconnect".to_string(),
        });
    }

    /// Called by the pump when a link reports it went down.
    pub(crate) fn link_closed(&self, link_id: u64, reason: &str) {
        {
            let mut inner = self.lock();
            match inner.link {
                Some((current, _)) if current == link_id => {}
                _ => {
                    tracing::debug!("Ignoring close of stale link {}", link_id);
                    return;
                }
            }
            inner.link = None;
            inner.phase = ConnectionPhase::Disconnected;
            inner.connected_devices.clear();
        }

        tracing::warn!("Tunnel connection lost: {}", reason);
        self.events.emit(TunnelEvent::ConnectionLost {
            reason: reason.to_string(),
        });
    }

    /// Record a peer seen on the tunnel.
    pub(crate) fn note_peer(&self, peer_id: &PeerId) {
        let mut inner = self.lock();
        if !inner.connected_devices.contains(peer_id) {
            inner.connected_devices.insert(peer_id.clone());
        }
    }

    pub fn connected_devices(&self) -> Vec<PeerId> {
        let mut devices: Vec<_> = self.lock().connected_devices.iter().cloned().collect();
        devices.sort();
        devices
    }

    pub fn is_device_connected(&self, peer_id: &PeerId) -> bool {
        self.lock().connected_devices.contains(peer_id)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().phase == ConnectionPhase::Connected
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.lock().phase
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.lock();
        ConnectionState {
            connected: inner.phase == ConnectionPhase::Connected,
            phase: inner.phase,
            peer_id: self.identity.get(),
            gateway_url: inner.gateway_url.clone(),
        }
    }

    /// Poll until connected or `timeout` elapses.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Build the WebSocket endpoint for a gateway HTTP address.
pub(crate) fn tunnel_endpoint(
    gateway_address: &str,
    code: &str,
    base_path: &str,
) -> Result<String, TunnelError> {
    let mut url = Url::parse(gateway_address)
        .map_err(|e| TunnelError::Connection(format!("Invalid gateway address {}: {}", gateway_address, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TunnelError::Connection(format!(
                "Unsupported gateway scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TunnelError::Connection(format!("Cannot use scheme {}", scheme)))?;

    let path = if base_path.is_empty() { "/" } else { base_path };
    url.set_path(path);
    url.set_query(None);
    if !code.is_empty() {
        url.query_pairs_mut().append_pair("code", code);
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MemoryTransport;

    fn manager(transport: Arc<MemoryTransport>) -> (ConnectionManager, EventBus, mpsc::UnboundedReceiver<TransportEvent>) {
        let events = EventBus::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(transport, NodeIdentity::new(), events.clone(), tx);
        (manager, events, rx)
    }

    #[test]
    fn test_tunnel_endpoint() {
        assert_eq!(
            tunnel_endpoint("https://gw.test", "C1", "/").unwrap(),
            "wss://gw.test/?code=C1"
        );
        assert_eq!(
            tunnel_endpoint("http://localhost:8718/api", "", "/tunnel").unwrap(),
            "ws://localhost:8718/tunnel"
        );
        assert!(tunnel_endpoint("ftp://gw.test", "C1", "/").is_err());
        assert!(tunnel_endpoint("not a url", "C1", "/").is_err());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, events, _rx) = manager(transport.clone());
        let mut subscriber = events.subscribe();

        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        manager.connect("https://gw.test", "C1", "/").await.unwrap();
        manager.connect("https://gw2.test", "C1", "/").await.unwrap();

        assert_eq!(transport.open_count(), 1);
        assert!(manager.is_connected());
        assert_eq!(manager.state().gateway_url.as_deref(), Some("https://gw2.test"));
        assert!(matches!(
            subscriber.recv().await.unwrap(),
            TunnelEvent::ConnectionEstablished { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_open_returns_to_disconnected() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_open();
        let (manager, _events, _rx) = manager(transport.clone());

        let result = manager.connect("https://gw.test", "C1", "/").await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _events, _rx) = manager(transport.clone());
        let message = TunnelMessage::new("pong", PeerId::from("dev-1"), PeerId::from("gateway"), serde_json::json!({}));

        assert!(matches!(
            manager.send(&message).await,
            Err(TunnelError::MessageSend(_))
        ));

        manager.connect("https://gw.test", "C1", "/").await.unwrap();
        manager.send(&message).await.unwrap();
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_devices_and_emits() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, events, _rx) = manager(transport.clone());
        manager.connect("https://gw.test", "C1", "/").await.unwrap();
        manager.note_peer(&PeerId::from("gateway"));
        assert!(manager.is_device_connected(&PeerId::from("gateway")));

        let mut subscriber = events.subscribe();
        manager.disconnect().await;

        assert!(!manager.is_connected());
        assert!(manager.connected_devices().is_empty());
        assert!(transport.closed_count() >= 1);
        assert!(matches!(
            subscriber.recv().await.unwrap(),
            TunnelEvent::ConnectionLost { .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_link_close_is_ignored() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _events, _rx) = manager(transport.clone());
        manager.connect("https://gw.test", "C1", "/").await.unwrap();

        manager.link_closed(99, "old link");
        assert!(manager.is_connected());

        manager.link_closed(1, "reset by peer");
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_bind_sets_identity() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, events, _rx) = manager(transport);
        let mut subscriber = events.subscribe();

        manager.bind(PeerId::from("dev-1"));
        assert_eq!(manager.state().peer_id, Some(PeerId::from("dev-1")));
        match subscriber.recv().await.unwrap() {
            TunnelEvent::DeviceRegistered { peer_id } => assert_eq!(peer_id.as_str(), "dev-1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_times_out() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _events, _rx) = manager(transport);
        assert!(!manager.wait_for_connection(Duration::from_millis(350)).await);
    }

    #[tokio::test]
    async fn test_wait_for_connection_sees_open_link() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _events, _rx) = manager(transport);
        manager.connect("https://gw.test", "C1", "/").await.unwrap();
        assert!(manager.wait_for_connection(Duration::from_millis(10)).await);
    }
}
