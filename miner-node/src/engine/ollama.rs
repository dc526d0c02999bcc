//! Ollama inference engine implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{ByteStream, EngineEndpoint, EngineHealth, InferenceEngine};
use crate::error::{Error, Result};

/// Ollama inference engine.
///
/// Communicates with an Ollama server to provide inference capabilities.
pub struct OllamaEngine {
    http_client: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl OllamaEngine {
    pub fn new(base_url: &str, probe_timeout: Duration) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout,
        }
    }

    fn url(&self, endpoint: EngineEndpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    async fn post(&self, endpoint: EngineEndpoint, body: &Value) -> Result<reqwest::Response> {
        let url = self.url(endpoint);
        tracing::debug!("Forwarding request to Ollama: {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InferenceFailed(format!("{}: {}", status, body)));
        }
        Ok(response)
    }
}

/// Response from /api/tags endpoint.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelInfo>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelInfo {
    name: String,
}

#[async_trait]
impl InferenceEngine for OllamaEngine {
    fn engine_type(&self) -> &'static str {
        "ollama"
    }

    async fn health_check(&self) -> Result<EngineHealth> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        if response.status().is_success() {
            let tags: OllamaTagsResponse = response
                .json()
                .await
                .map_err(|e| Error::Communication(e.to_string()))?;

            Ok(EngineHealth {
                is_healthy: true,
                models_loaded: tags.models.into_iter().map(|m| m.name).collect(),
            })
        } else {
            Err(Error::EngineNotAvailable(format!(
                "Ollama returned {}",
                response.status()
            )))
        }
    }

    async fn forward(&self, endpoint: EngineEndpoint, body: &Value) -> Result<Value> {
        self.post(endpoint, body)
            .await?
            .json()
            .await
            .map_err(|e| Error::InferenceFailed(e.to_string()))
    }

    async fn forward_stream(&self, endpoint: EngineEndpoint, body: &Value) -> Result<ByteStream> {
        let response = self.post(endpoint, body).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Communication(e.to_string())))
            .boxed())
    }
}
