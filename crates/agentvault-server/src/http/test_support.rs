//! Shared fixtures for handler tests.
//!
//! Builds the real router over an in-memory store; the object broker presigns
//! locally against a dummy endpoint, so no network is involved.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use clap::Parser;
use serde_json::{json, Value};
use tower::ServiceExt;

use agentvault_core::DataStore;

use crate::config::Config;
use crate::http::{build_router, AppState};
use crate::objectstore::ObjectStoreBroker;
use crate::storage::SqliteStore;

/// Knob override disabling the backup frequency gate.
pub const NO_INTERVAL: &[&str] = &["--min-backup-interval-hours", "0"];

/// Build an app over a fresh in-memory store. `extra_args` override config
/// knobs the same way flags would.
pub async fn test_app(extra_args: &[&str]) -> Router {
    let mut argv = vec![
        "agentvault-server",
        "--object-endpoint",
        "http://127.0.0.1:9000",
        "--object-public-endpoint",
        "http://localhost:19000",
        "--object-bucket",
        "test-backups",
        "--object-access-key",
        "test-access",
        "--object-secret-key",
        "test-secret",
    ];
    argv.extend_from_slice(extra_args);
    let config = Config::parse_from(argv);

    let store: Arc<dyn DataStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let broker = Arc::new(ObjectStoreBroker::connect(&config).await.unwrap());
    build_router(AppState::new(store, broker, config))
}

/// Send a request and return `(status, parsed JSON body)`. Non-JSON bodies
/// parse as `Value::Null`.
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for &(name, value) in headers {
        builder = builder.header(name, value);
    }

    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// Register an agent and return `(agent_id, token)`. The agent starts
/// pending.
pub async fn register(app: &Router, name: &str) -> (String, String) {
    let (status, body) = send(
        app,
        "POST",
        "/v1/agents/register",
        &[],
        Some(json!({ "agent_name": name, "hostname": "devbox" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {body}");

    (
        body["agent_id"].as_str().unwrap().to_string(),
        body["token"].as_str().unwrap().to_string(),
    )
}

/// Register an agent and approve it through the admin surface.
pub async fn register_active(app: &Router, name: &str) -> (String, String) {
    let (agent_id, token) = register(app, name).await;
    let (status, _) = send(
        app,
        "POST",
        &format!("/v1/admin/agents/{agent_id}/approve"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (agent_id, token)
}

/// Request upload URLs for a backup with the given timestamp and size.
pub async fn upload(
    app: &Router,
    token: &str,
    timestamp: &str,
    encrypted_bytes: i64,
) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        "/v1/backups/upload-url",
        &[("authorization", &bearer(token))],
        Some(json!({
            "timestamp": timestamp,
            "encrypted_bytes": encrypted_bytes,
            "encrypted_sha256": "abc123",
        })),
    )
    .await
}
