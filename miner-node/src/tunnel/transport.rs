//! Transport seam between the connection manager and the wire.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use miner_common::TunnelMessage;

use super::TunnelError;

/// Delivered by a transport to the tunnel pump, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(TunnelMessage),
    /// The link identified by `link_id` went down without being asked to.
    Closed { link_id: u64, reason: String },
}

/// An open link to the gateway.
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn send(&self, message: &TunnelMessage) -> Result<(), TunnelError>;

    /// Tear the link down. No `Closed` event is emitted for a requested close.
    async fn close(&self);
}

/// Opens links to the gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
        link_id: u64,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>, TunnelError>;
}

/// WebSocket transport carrying JSON text frames.
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &self,
        endpoint: &str,
        link_id: u64,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>, TunnelError> {
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| TunnelError::Connection(format!("Timed out connecting to {}", endpoint)))?
            .map_err(|e| TunnelError::Connection(e.to_string()))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<Message>(32);
        let task = tokio::spawn(socket_loop(write, read, rx, link_id, inbound));

        tracing::info!("Tunnel link {} open to {}", link_id, endpoint);

        Ok(Arc::new(WebSocketLink {
            tx,
            task: Mutex::new(Some(task)),
        }))
    }
}

struct WebSocketLink {
    tx: mpsc::Sender<Message>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        let json =
            serde_json::to_string(message).map_err(|e| TunnelError::MessageSend(e.to_string()))?;
        self.tx
            .send(Message::Text(json))
            .await
            .map_err(|_| TunnelError::MessageSend("Tunnel link is closed".to_string()))
    }

    async fn close(&self) {
        // Best effort close frame before the socket task goes away
        let _ = self.tx.try_send(Message::Close(None));
        tokio::task::yield_now().await;

        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn socket_loop<S, R>(
    mut write: S,
    mut read: R,
    mut rx: mpsc::Receiver<Message>,
    link_id: u64,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let reason = loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(frame) = outgoing else {
                    break "Link dropped".to_string();
                };
                if let Err(e) = write.send(frame).await {
                    break format!("WebSocket write failed: {}", e);
                }
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<TunnelMessage>(&text) {
                            Ok(message) => {
                                if inbound.send(TransportEvent::Message(message)).is_err() {
                                    break "Tunnel pump stopped".to_string();
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Dropping malformed tunnel frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break format!("WebSocket write failed: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        break "Gateway sent close frame".to_string();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break format!("WebSocket error: {}", e);
                    }
                    None => {
                        break "WebSocket stream ended".to_string();
                    }
                }
            }
        }
    };

    tracing::warn!("Tunnel link {} closed: {}", link_id, reason);
    let _ = inbound.send(TransportEvent::Closed { link_id, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use miner_common::PeerId;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Accepts one WebSocket client, pushes `frames` to it and echoes back
    /// whatever text it receives first.
    async fn spawn_gateway(frames: Vec<String>) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    let _ = seen_tx.send(text);
                    break;
                }
            }
            let _ = ws.close(None).await;
        });

        (format!("ws://{}/", addr), seen_rx)
    }

    #[tokio::test]
    async fn test_websocket_link_delivers_frames_in_order() {
        let first = TunnelMessage::new("ping", PeerId::from("gateway"), PeerId::from("dev-1"), json!({"n": 1}));
        let second = TunnelMessage::new("ping", PeerId::from("gateway"), PeerId::from("dev-1"), json!({"n": 2}));
        let frames = vec![
            serde_json::to_string(&first).unwrap(),
            "not json".to_string(),
            serde_json::to_string(&second).unwrap(),
        ];
        let (endpoint, seen) = spawn_gateway(frames).await;

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new(Duration::from_secs(5));
        let link = transport.open(&endpoint, 1, inbound_tx).await.unwrap();

        let Some(TransportEvent::Message(a)) = inbound_rx.recv().await else {
            panic!("expected first message");
        };
        let Some(TransportEvent::Message(b)) = inbound_rx.recv().await else {
            panic!("expected second message");
        };
        assert_eq!(a.payload["n"], 1);
        assert_eq!(b.payload["n"], 2);

        let pong = TunnelMessage::new("pong", PeerId::from("dev-1"), PeerId::from("gateway"), json!({}));
        link.send(&pong).await.unwrap();
        let echoed: TunnelMessage = serde_json::from_str(&seen.await.unwrap()).unwrap();
        assert_eq!(echoed.message_type, "pong");

        match inbound_rx.recv().await {
            Some(TransportEvent::Closed { link_id, .. }) => assert_eq!(link_id, 1),
            other => panic!("expected close event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_unreachable_endpoint_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new(Duration::from_secs(2));
        let result = transport.open(&format!("ws://{}/", addr), 1, inbound_tx).await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
    }
}
