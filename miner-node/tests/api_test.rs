//! Integration tests for the miner-node HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use miner_node::device::{DeviceConfig, HttpGatewayClient};
use miner_node::engine::OllamaEngine;
use miner_node::store::{MemoryStore, Store};
use miner_node::task::FixedBlockReward;
use miner_node::test_util::{FixedProbe, MemoryTransport};
use miner_node::{api, AppState, Config, Services};

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    transport: Arc<MemoryTransport>,
}

/// App whose gateway and engine both live on `server`.
fn test_app(server: &MockServer) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let services = Services {
        gateway: Arc::new(
            HttpGatewayClient::new(Duration::from_secs(5), Duration::from_secs(30)).unwrap(),
        ),
        engine: Arc::new(OllamaEngine::new(&server.uri(), Duration::from_secs(2))),
        probe: Arc::new(FixedProbe::default()),
        store: store.clone(),
        transport: transport.clone(),
        rewards: Arc::new(FixedBlockReward(42)),
    };
    let state = AppState::build(Config::default(), services).unwrap();
    TestApp {
        app: api::app(state.clone()),
        state,
        store,
        transport,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>, Option<String>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec(), content_type)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn registration_body(server: &MockServer) -> Value {
    json!({
        "code": "C1",
        "gateway_address": server.uri(),
        "reward_address": "0xabc",
        "key": "secret-key"
    })
}

async fn mount_register_success(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/node/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "node_id": "dev-1", "name": "Node1"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "llama3.2:3b"}]
        })))
        .mount(&server)
        .await;
    let t = test_app(&server);

    let (status, body, _) = send(&t.app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine"]["healthy"], true);
    assert_eq!(body["engine"]["models"][0], "llama3.2:3b");
    assert_eq!(body["registered"], false);
}

#[tokio::test]
async fn test_register_then_status_redacts_key() {
    let server = MockServer::start().await;
    mount_register_success(&server).await;
    let t = test_app(&server);

    let (status, body, _) = send(
        &t.app,
        post_json("/api/v1/device-status/register", registration_body(&server)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "Registration successful, starting heartbeat"
    );

    let (_, body, _) = send(&t.app, get("/api/v1/device-status/gateway-status")).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"isRegistered": true}));

    let (_, body, _) = send(&t.app, get("/api/v1/device-status")).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["config"]["deviceId"], "dev-1");
    assert_eq!(body["config"]["key"], "***");
    assert_eq!(body["state"], "Registered");
    assert_eq!(body["tunnel"]["connected"], true);
    assert_eq!(t.transport.open_count(), 1);
}

#[tokio::test]
async fn test_register_rejection_is_500_with_error_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/node/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false, "error": "invalid code"
        })))
        .mount(&server)
        .await;
    let t = test_app(&server);

    let (status, body, _) = send(
        &t.app,
        post_json("/api/v1/device-status/register", registration_body(&server)),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8(body).unwrap().contains("invalid code"));
    assert!(!t.state.registration.is_registered());
}

#[tokio::test]
async fn test_unregister_clears_registration() {
    let server = MockServer::start().await;
    mount_register_success(&server).await;
    let t = test_app(&server);
    send(
        &t.app,
        post_json("/api/v1/device-status/register", registration_body(&server)),
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/device-status/unregister")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&t.app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(!t.state.registration.is_registered());
    assert!(!t.state.tunnel.is_connected());
    assert!(t.store.load_device_config().unwrap().is_none());
}

#[tokio::test]
async fn test_generate_without_stream_tracks_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.2:3b",
            "response": "Hello!",
            "done": true,
            "prompt_eval_count": 10,
            "eval_count": 5
        })))
        .expect(1)
        .mount(&server)
        .await;
    let t = test_app(&server);

    let (status, body, _) = send(
        &t.app,
        post_json(
            "/ollama/api/generate",
            json!({"model": "llama3.2:3b", "prompt": "Hi", "stream": false}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["response"], "Hello!");

    let (_, body, _) = send(&t.app, get("/api/v1/miner/history?page=1&limit=5")).await;
    let history: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(history["total"], 1);
    assert_eq!(history["tasks"][0]["status"], "succeed");
    assert_eq!(history["tasks"][0]["eval_count"], 5);

    let (_, body, _) = send(&t.app, get("/api/v1/miner/summary")).await;
    let summary: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(summary["earnings"]["totalBlockRewards"], 42);
    assert_eq!(summary["earnings"]["totalJobRewards"], 15);
}

#[tokio::test]
async fn test_chat_streams_ndjson_by_default() {
    let server = MockServer::start().await;
    let ndjson = concat!(
        "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
        "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":3,\"eval_count\":2}\n"
    );
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(wiremock::matchers::body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson))
        .mount(&server)
        .await;
    let t = test_app(&server);

    let (status, body, content_type) = send(
        &t.app,
        post_json(
            "/ollama/api/chat",
            json!({"model": "llama3.2:3b", "messages": [{"role": "user", "content": "Hi"}]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/x-ndjson"));
    assert_eq!(String::from_utf8(body).unwrap(), ndjson);

    let earnings = t.store.list_earnings().unwrap();
    assert_eq!(earnings.len(), 1);
    assert_eq!(earnings[0].job_rewards, 5);
}

#[tokio::test]
async fn test_engine_failure_marks_task_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&server)
        .await;
    let t = test_app(&server);

    let (status, _, _) = send(
        &t.app,
        post_json("/ollama/api/generate", json!({"model": "m", "prompt": "x"})),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let history = t.store.task_history(1, 10).unwrap();
    assert_eq!(history.tasks[0].status.as_str(), "failed");
    assert!(t.store.list_earnings().unwrap().is_empty());
}

#[tokio::test]
async fn test_auto_registration_status() {
    let server = MockServer::start().await;
    let t = test_app(&server);

    let (status, body, _) = send(&t.app, get("/api/v1/device-status/auto-registration")).await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["enabled"], true);
    assert_eq!(body["isRegistering"], false);
    assert_eq!(body["retryCount"], 0);
    assert_eq!(body["maxRetries"], 5);
}

#[tokio::test]
async fn test_device_list_is_empty_before_heartbeat() {
    let server = MockServer::start().await;
    let t = test_app(&server);

    let (status, body, _) = send(&t.app, get("/api/v1/device-status/list")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!([]));
}

#[tokio::test]
async fn test_reinitialize_returns_while_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/node/register"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let t = test_app(&server);
    t.store
        .save_device_config(&DeviceConfig {
            device_id: "dev-1".to_string(),
            device_name: "Node1".to_string(),
            gateway_address: server.uri(),
            reward_address: "0xabc".to_string(),
            key: "K".to_string(),
            code: "C1".to_string(),
            base_path: "/tunnel".to_string(),
            is_registered: false,
            timestamp: None,
        })
        .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/device-status/reinitialize")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = tokio::time::timeout(Duration::from_secs(5), send(&t.app, request))
        .await
        .expect("reinitialize blocked on auto-registration");

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["hasRegistrationInfo"], true);
    assert_eq!(body["isRegistered"], false);
}
