use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use miner_common::TunnelMessage;

use crate::tunnel::{Transport, TransportEvent, TransportLink, TunnelError};

/// Transport that keeps everything in memory and records what it saw.
#[derive(Default)]
pub struct MemoryTransport {
    opens: AtomicUsize,
    fail_next: AtomicBool,
    endpoints: Mutex<Vec<String>>,
    inbound: Mutex<Option<(u64, mpsc::UnboundedSender<TransportEvent>)>>,
    shared: Arc<LinkShared>,
}

#[derive(Default)]
struct LinkShared {
    sent: Mutex<Vec<TunnelMessage>>,
    closes: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` fail with a connection error.
    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make every send on open links fail.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<TunnelMessage> {
        self.shared.sent.lock().unwrap().clone()
    }

    /// Push a frame as if the gateway had sent it. Returns false when no link is open.
    pub fn deliver(&self, message: TunnelMessage) -> bool {
        match self.inbound.lock().unwrap().as_ref() {
            Some((_, tx)) => tx.send(TransportEvent::Message(message)).is_ok(),
            None => false,
        }
    }

    /// Simulate the gateway dropping the current link.
    pub fn drop_link(&self, reason: &str) {
        if let Some((link_id, tx)) = self.inbound.lock().unwrap().take() {
            let _ = tx.send(TransportEvent::Closed {
                link_id,
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(
        &self,
        endpoint: &str,
        link_id: u64,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>, TunnelError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TunnelError::Connection("connection refused".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        *self.inbound.lock().unwrap() = Some((link_id, inbound));
        Ok(Arc::new(MemoryLink {
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryLink {
    shared: Arc<LinkShared>,
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn send(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(TunnelError::MessageSend("write failed".to_string()));
        }
        self.shared.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}
