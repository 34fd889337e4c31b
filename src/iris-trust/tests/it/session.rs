//! Session reverification policy against a local mock server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use iris_trust::session::{TOKEN_KEY, USER_KEY};
use iris_trust::{
    EncryptedFileStore, KeyValueStore, MemoryStore, SecureChannel, SessionManager, TrustConfig, TrustError,
    VerificationOutcome,
};
use serde_json::{json, Value};

use crate::common::{config_for, dead_origin, files_in, identity, spawn_server, Hits};

const TOKEN: &str = "tok-1";
const EK: &str = "ab12cd34ef";
const HWID: &str = "AB12CD34EF";

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

/// `/session/verify` answering with `status` and `body`.
async fn verify_server(status: StatusCode, body: Value, hits: Hits) -> String {
    let router = Router::new().route(
        "/api/iris/session/verify",
        get(move |headers: HeaderMap| {
            let body = body.clone();
            let hits = hits.clone();
            async move {
                hits.bump();
                if !bearer_ok(&headers) {
                    return (StatusCode::UNAUTHORIZED, Json(json!({ "success": false })));
                }
                (status, Json(body))
            }
        }),
    );
    spawn_server(router).await
}

async fn seed(store: &dyn KeyValueStore, hardware_id: &str) {
    let user = json!({
        "id": "u-1",
        "discordId": "42",
        "username": "ace",
        "hardwareId": hardware_id,
    });
    store.set(USER_KEY, user.to_string().as_bytes()).await.unwrap();
    store
        .set(TOKEN_KEY, json!({ "token": TOKEN }).to_string().as_bytes())
        .await
        .unwrap();
}

fn manager(config: &TrustConfig, store: Arc<dyn KeyValueStore>, tpm: bool) -> SessionManager {
    let channel = Arc::new(SecureChannel::new(config).unwrap());
    SessionManager::new(config, channel, identity(EK, tpm), store)
}

async fn is_cleared(store: &dyn KeyValueStore) -> bool {
    store.get(USER_KEY).await.unwrap().is_none() && store.get(TOKEN_KEY).await.unwrap().is_none()
}

/// Every file in the store directory with its raw bytes.
fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<_> = files_in(dir)
        .into_iter()
        .map(|p| {
            let bytes = std::fs::read(&p).unwrap();
            (p, bytes)
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_no_session() {
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&dead_origin().await, root.path());
    let manager = manager(&config, Arc::new(MemoryStore::new()), true);

    assert_eq!(manager.verify().await, VerificationOutcome::NoSession);
}

#[tokio::test]
async fn test_connection_error_leaves_store_untouched() {
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&dead_origin().await, root.path());
    let store = Arc::new(EncryptedFileStore::open(root.path().join("store")).await.unwrap());
    seed(store.as_ref(), HWID).await;
    let before = snapshot(store.dir());

    let outcome = manager(&config, store.clone(), true).verify().await;

    assert!(matches!(outcome, VerificationOutcome::Unreachable { .. }), "{outcome:?}");
    assert!(!outcome.clears_session());
    assert_eq!(snapshot(store.dir()), before);
}

#[tokio::test]
async fn test_unauthorized_clears_session() {
    let hits = Hits::default();
    let api = verify_server(
        StatusCode::UNAUTHORIZED,
        json!({ "success": false, "reason": "token_expired" }),
        hits.clone(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let store = Arc::new(EncryptedFileStore::open(root.path().join("store")).await.unwrap());
    seed(store.as_ref(), HWID).await;

    let outcome = manager(&config, store.clone(), true).verify().await;

    assert_eq!(
        outcome,
        VerificationOutcome::AuthRejected {
            reason: Some("token_expired".into())
        }
    );
    assert_eq!(hits.count(), 1);
    assert!(is_cleared(store.as_ref()).await);
}

#[tokio::test]
async fn test_unsuccessful_reply_clears_session() {
    let api = verify_server(
        StatusCode::OK,
        json!({ "success": false, "message": "Session revoked" }),
        Hits::default(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), HWID).await;

    let outcome = manager(&config, store.clone(), true).verify().await;

    assert_eq!(
        outcome,
        VerificationOutcome::AuthRejected {
            reason: Some("Session revoked".into())
        }
    );
    assert!(is_cleared(store.as_ref()).await);
}

#[tokio::test]
async fn test_server_error_keeps_session() {
    let api = verify_server(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "success": false, "message": "Server error" }),
        Hits::default(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), HWID).await;

    let outcome = manager(&config, store.clone(), true).verify().await;

    assert_eq!(
        outcome,
        VerificationOutcome::OtherServerError {
            status: Some(500),
            reason: "Server error".into()
        }
    );
    assert!(!is_cleared(store.as_ref()).await);
}

#[tokio::test]
async fn test_success_refreshes_profile() {
    let api = verify_server(
        StatusCode::OK,
        json!({
            "success": true,
            "user": { "_id": "u-1", "username": "ace-renamed", "avatarUrl": "https://cdn/a.png" }
        }),
        Hits::default(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), HWID).await;
    let manager = manager(&config, store.clone(), true);

    let outcome = manager.verify().await;

    let VerificationOutcome::Success { profile } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(profile.username, "ace-renamed");
    assert_eq!(profile.hardware_id, HWID);

    let session = manager.current().await.unwrap().unwrap();
    assert_eq!(session.profile.username, "ace-renamed");
    assert_eq!(session.token, TOKEN);
}

#[tokio::test]
async fn test_hardware_mismatch_clears_without_network() {
    let hits = Hits::default();
    let api = verify_server(StatusCode::OK, json!({ "success": true }), hits.clone()).await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), "SOME-OTHER-MACHINE").await;

    let outcome = manager(&config, store.clone(), true).verify().await;

    assert_eq!(
        outcome,
        VerificationOutcome::HardwareMismatch {
            stored: "SOME-OTHER-MACHINE".into(),
            observed: HWID.into(),
        }
    );
    assert_eq!(hits.count(), 0);
    assert!(is_cleared(store.as_ref()).await);
}

#[tokio::test]
async fn test_required_tpm_missing_blocks() {
    let hits = Hits::default();
    let api = verify_server(StatusCode::OK, json!({ "success": true }), hits.clone()).await;
    let root = tempfile::tempdir().unwrap();
    let config = TrustConfig {
        require_tpm: true,
        ..config_for(&api, root.path())
    };
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), HWID).await;

    let outcome = manager(&config, store.clone(), false).verify().await;

    assert!(matches!(outcome, VerificationOutcome::TpmBlocked { .. }), "{outcome:?}");
    assert_eq!(hits.count(), 0);
    assert!(is_cleared(store.as_ref()).await);
}

// =============================================================================
// Login / logout
// =============================================================================

async fn register_server(status: StatusCode, reply: Value) -> String {
    let router = Router::new().route(
        "/api/iris/register-hardware",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let reply = reply.clone();
            async move {
                if !bearer_ok(&headers) || body["hardwareId"] != HWID || body.get("systemInfo").is_none() {
                    return (StatusCode::BAD_REQUEST, Json(json!({ "success": false })));
                }
                (status, Json(reply))
            }
        }),
    );
    spawn_server(router).await
}

fn profile() -> iris_trust::UserProfile {
    iris_trust::UserProfile {
        id: "u-1".into(),
        discord_id: Some("42".into()),
        username: "ace".into(),
        avatar_url: None,
        hardware_id: String::new(),
    }
}

#[tokio::test]
async fn test_login_binds_observed_hardware() {
    let api = register_server(StatusCode::OK, json!({ "success": true })).await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&config, store.clone(), true);

    let session = manager.login(TOKEN, profile(), None).await.unwrap();

    assert_eq!(session.hardware_id(), HWID);
    assert_eq!(manager.current().await.unwrap(), Some(session));
}

#[tokio::test]
async fn test_login_rejected_stores_nothing() {
    let api = register_server(
        StatusCode::FORBIDDEN,
        json!({ "success": false, "message": "This machine is already registered to another account" }),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let store = Arc::new(MemoryStore::new());

    let err = manager(&config, store.clone(), true)
        .login(TOKEN, profile(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, TrustError::HttpStatus { status: 403, .. }));
    assert!(is_cleared(store.as_ref()).await);
}

#[tokio::test]
async fn test_logout_clears() {
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&dead_origin().await, root.path());
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), HWID).await;

    manager(&config, store.clone(), true).logout().await.unwrap();

    assert!(is_cleared(store.as_ref()).await);
}
