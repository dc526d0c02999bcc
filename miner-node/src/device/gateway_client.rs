//! HTTP client for the gateway's node endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use miner_common::{HeartbeatRequest, RegisterReply, RegisterRequest, RegisterResponse};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Network(String),

    #[error("Gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid gateway response: {0}")]
    Decode(String),
}

/// Calls made by the node against its gateway.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// `POST {gateway}/node/register`. A 5xx answer, as HTTP status or as
    /// enveloped `code`, is an error.
    async fn register(
        &self,
        gateway_address: &str,
        key: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, GatewayError>;

    /// `POST {gateway}/node/heartbeat`. Any non-2xx answer is an error.
    async fn heartbeat(
        &self,
        gateway_address: &str,
        key: &str,
        request: &HeartbeatRequest,
    ) -> Result<(), GatewayError>;
}

/// [`GatewayApi`] over `reqwest`.
pub struct HttpGatewayClient {
    http_client: Client,
}

impl HttpGatewayClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self { http_client })
    }
}

fn endpoint(gateway_address: &str, path: &str) -> String {
    format!("{}{}", gateway_address.trim_end_matches('/'), path)
}

#[async_trait]
impl GatewayApi for HttpGatewayClient {
    async fn register(
        &self,
        gateway_address: &str,
        key: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, GatewayError> {
        let url = endpoint(gateway_address, "/node/register");
        tracing::debug!("Registering device with gateway: {}", url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(key)
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if status.is_server_error() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: RegisterReply = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => {
                return Err(GatewayError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
            Err(e) => return Err(GatewayError::Decode(e.to_string())),
        };

        if let Some(code) = reply.code() {
            if code >= 500 {
                return Err(GatewayError::Status { status: code, body });
            }
        }

        Ok(reply.into_response())
    }

    async fn heartbeat(
        &self,
        gateway_address: &str,
        key: &str,
        request: &HeartbeatRequest,
    ) -> Result<(), GatewayError> {
        let url = endpoint(gateway_address, "/node/heartbeat");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(key)
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
