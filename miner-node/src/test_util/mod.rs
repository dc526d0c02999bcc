//! In-process fakes for the tunnel transport and host probes.

pub mod mock_transport;

pub use mock_transport::MemoryTransport;

use std::sync::Arc;

use async_trait::async_trait;

use crate::device::{HostSnapshot, SystemProbe};
use crate::tunnel::{default_registry, HandlerRegistry, TunnelService};

/// System probe returning fixed values.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    pub snapshot: HostSnapshot,
}

impl Default for FixedProbe {
    fn default() -> Self {
        Self {
            snapshot: HostSnapshot {
                ip: "10.0.0.7".to_string(),
                cpu_usage: 12.5,
                memory_usage: 40.0,
                gpu_usage: 0.0,
                device_type: "linux".to_string(),
                device_model: "Test GPU".to_string(),
                device_info: "test host".to_string(),
            },
        }
    }
}

#[async_trait]
impl SystemProbe for FixedProbe {
    async fn ip_address(&self) -> String {
        self.snapshot.ip.clone()
    }

    async fn device_type(&self) -> String {
        self.snapshot.device_type.clone()
    }

    async fn device_model(&self) -> String {
        self.snapshot.device_model.clone()
    }

    async fn snapshot(&self) -> HostSnapshot {
        self.snapshot.clone()
    }
}

/// Tunnel service over a [`MemoryTransport`] with the default handler table.
pub fn memory_tunnel() -> (Arc<TunnelService>, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let registry = default_registry().unwrap_or_else(|_| HandlerRegistry::new());
    let service = TunnelService::start(registry, transport.clone());
    (service, transport)
}
