//! Host identification and resource usage.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sysinfo::System;
use tokio::net::UdpSocket;

const FALLBACK_IP: &str = "127.0.0.1";

/// Point-in-time description of the host, as reported in heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSnapshot {
    pub ip: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub gpu_usage: f64,
    pub device_type: String,
    pub device_model: String,
    /// JSON-encoded host description.
    pub device_info: String,
}

/// Source of local identification and metrics.
///
/// Every method is best-effort: failures yield neutral values, never errors.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn ip_address(&self) -> String;

    async fn device_type(&self) -> String;

    async fn device_model(&self) -> String;

    async fn snapshot(&self) -> HostSnapshot;
}

/// [`SystemProbe`] backed by `sysinfo`.
pub struct HostProbe {
    device_type: String,
    gpu_model: String,
    system: Mutex<System>,
}

impl HostProbe {
    pub fn new(device_type: &str, gpu_model: &str) -> Self {
        Self {
            device_type: device_type.to_string(),
            gpu_model: gpu_model.to_string(),
            system: Mutex::new(System::new_all()),
        }
    }

    /// CPU and memory usage in percent. CPU usage becomes meaningful from the
    /// second refresh on.
    fn usage(&self) -> (f64, f64) {
        let Ok(mut sys) = self.system.lock() else {
            return (0.0, 0.0);
        };
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = sys.global_cpu_usage() as f64;
        let total = sys.total_memory();
        let memory = if total > 0 {
            (sys.used_memory() as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (round2(cpu), round2(memory))
    }

    fn device_info(&self) -> String {
        let Ok(sys) = self.system.lock() else {
            return "{}".to_string();
        };
        let os = format!(
            "{} {}",
            System::name().unwrap_or_else(|| "Unknown".to_string()),
            System::os_version().unwrap_or_default()
        );
        let cpu = sys
            .cpus()
            .first()
            .map(|c| format!("{} {}MHz", c.brand().trim(), c.frequency()))
            .unwrap_or_else(|| "Unknown".to_string());
        let memory = format!("{:.1}GB", sys.total_memory() as f64 / 1024.0 / 1024.0 / 1024.0);

        json!({
            "os": os.trim(),
            "cpu": cpu,
            "cores": sys.cpus().len(),
            "memory": memory,
            "graphics": [{ "model": self.gpu_model }],
        })
        .to_string()
    }
}

#[async_trait]
impl SystemProbe for HostProbe {
    async fn ip_address(&self) -> String {
        local_ip().await.unwrap_or_else(|| FALLBACK_IP.to_string())
    }

    async fn device_type(&self) -> String {
        self.device_type.clone()
    }

    async fn device_model(&self) -> String {
        self.gpu_model.clone()
    }

    async fn snapshot(&self) -> HostSnapshot {
        let ip = self.ip_address().await;
        let (cpu_usage, memory_usage) = self.usage();

        HostSnapshot {
            ip,
            cpu_usage,
            memory_usage,
            // No portable GPU utilization source
            gpu_usage: 0.0,
            device_type: self.device_type.clone(),
            device_model: self.gpu_model.clone(),
            device_info: self.device_info(),
        }
    }
}

/// Address of the interface used for outbound traffic. No packet is sent.
async fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    let addr = socket.local_addr().ok()?;
    Some(addr.ip().to_string())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
