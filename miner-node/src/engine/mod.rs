//! Inference engine abstraction layer.
//!
//! The node does not interpret inference requests. Bodies are forwarded to
//! the local engine as-is and its answers are returned verbatim, either as a
//! single JSON document or as a raw NDJSON byte stream.

mod ollama;

pub use ollama::OllamaEngine;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Raw response body chunks, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Health status of an inference engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub is_healthy: bool,
    #[serde(default)]
    pub models_loaded: Vec<String>,
}

/// Inference endpoints the node proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEndpoint {
    Chat,
    Generate,
}

impl EngineEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            EngineEndpoint::Chat => "/api/chat",
            EngineEndpoint::Generate => "/api/generate",
        }
    }
}

/// Primary trait for inference engines.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Unique identifier for this engine type (e.g., "ollama").
    fn engine_type(&self) -> &'static str;

    /// Check if the engine is available and responding.
    async fn health_check(&self) -> Result<EngineHealth>;

    /// Send `body` and return the complete JSON answer.
    async fn forward(&self, endpoint: EngineEndpoint, body: &Value) -> Result<Value>;

    /// Send `body` and return the answer as a chunk stream. Fails before the
    /// first chunk when the engine rejects the request.
    async fn forward_stream(&self, endpoint: EngineEndpoint, body: &Value) -> Result<ByteStream>;
}

/// Whether the request asks for a streamed answer. An absent or null
/// `stream` field means streaming, and is written back into `body` so the
/// engine sees the same choice.
pub fn resolve_stream_flag(body: &mut Value) -> bool {
    let Some(object) = body.as_object_mut() else {
        return true;
    };
    match object.get("stream").and_then(Value::as_bool) {
        Some(stream) => stream,
        None => {
            object.insert("stream".to_string(), Value::Bool(true));
            true
        }
    }
}

/// Model named by an inference request, empty when absent.
pub fn requested_model(body: &Value) -> String {
    body.get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
