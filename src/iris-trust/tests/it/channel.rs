//! Signed transport against a local mock server.

use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::from_fn;
use axum::routing::get;
use axum::{Json, Router};
use iris_trust::{ResponseSignaturePolicy, SecureChannel, TrustConfig, TrustError};
use serde_json::{json, Value};

use crate::common::{config_for, server_signatures, signed_headers, spawn_server};

const PING_BODY: &str = r#"{"success":true,"message":"pong"}"#;

/// `/ping` signed by the signature layer, `/forged` signed over a different
/// body, and `/busy` rate-limited.
async fn server() -> String {
    let router = Router::new()
        .route(
            "/api/iris/ping",
            get(|| async { ([(header::CONTENT_TYPE, "application/json")], PING_BODY) }),
        )
        .route(
            "/api/iris/forged",
            get(|| async { (signed_headers("/iris/forged", br#"{"success":false}"#), PING_BODY) }),
        )
        .route(
            "/api/iris/busy",
            get(|| async { (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "message": "slow down" }))) }),
        )
        .route(
            "/api/iris/whoami",
            get(|headers: HeaderMap| async move {
                let client = headers.get("X-Iris-Client").and_then(|v| v.to_str().ok()).unwrap_or("");
                let version = headers.get("X-Iris-Version").and_then(|v| v.to_str().ok()).unwrap_or("");
                Json(json!({ "client": client, "version": version }))
            }),
        )
        .layer(from_fn(server_signatures));
    spawn_server(router).await
}

fn channel(origin: &str, policy: ResponseSignaturePolicy) -> (SecureChannel, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let config = TrustConfig {
        response_signature_policy: policy,
        ..config_for(origin, root.path())
    };
    (SecureChannel::new(&config).unwrap(), root)
}

#[tokio::test]
async fn test_signed_response_accepted_under_enforce() {
    let origin = server().await;
    let (channel, _root) = channel(&origin, ResponseSignaturePolicy::Enforce);

    let reply: Value = channel.get_json("/ping", None).await.unwrap();
    assert_eq!(reply["message"], "pong");
}

#[tokio::test]
async fn test_forged_response_rejected_under_enforce() {
    let origin = server().await;
    let (channel, _root) = channel(&origin, ResponseSignaturePolicy::Enforce);

    let err = channel.get_json::<Value>("/forged", None).await.unwrap_err();
    assert!(err.is_integrity_violation(), "{err}");
}

#[tokio::test]
async fn test_forged_response_passes_under_warn() {
    let origin = server().await;
    let (channel, _root) = channel(&origin, ResponseSignaturePolicy::Warn);

    let reply: Value = channel.get_json("/forged", None).await.unwrap();
    assert_eq!(reply["message"], "pong");
}

#[tokio::test]
async fn test_rate_limit_is_retryable() {
    let origin = server().await;
    let (channel, _root) = channel(&origin, ResponseSignaturePolicy::Warn);

    let err = channel.get_json::<Value>("/busy", None).await.unwrap_err();
    assert!(matches!(err, TrustError::HttpStatus { status: 429, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_identity_headers_sent() {
    let origin = server().await;
    let (channel, _root) = channel(&origin, ResponseSignaturePolicy::Warn);

    let reply: Value = channel.get_json("/whoami", None).await.unwrap();
    assert_eq!(reply, json!({ "client": "desktop", "version": "1.0.0" }));
}

#[tokio::test]
async fn test_unsigned_request_rejected_by_server_rule() {
    let origin = server().await;

    let response = reqwest::get(format!("{origin}/api/iris/ping")).await.unwrap();

    assert_eq!(response.status().as_u16(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["serverPath"], "/iris/ping");
}
