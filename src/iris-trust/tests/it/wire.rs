//! End-to-end signing against a server that derives every signed path from
//! the request URI, with response signatures enforced.

use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{StatusCode, Uri};
use axum::middleware::from_fn;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use iris_crypto::{MessageAuthenticator, SecretString};
use iris_trust::types::ChallengeSolution;
use iris_trust::{
    AuthOutcome, AuthenticationProtocol, IntegrityAttestor, NeverUpdate, ResponseSignaturePolicy, SecureChannel,
    TrustConfig, TrustError, UpdateManager,
};
use serde_json::json;

use crate::common::{
    config_for, identity, server_path, server_signatures, signed_headers, spawn_server, Hits, RecordingExit,
    RecordingLauncher, CLIENT_SECRET,
};

const HWID: &str = "0123ABCD";
const FILE_HASH: &str = "5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef";

/// Challenge, verify and update-check routes, each recording the server path
/// it was reached on.
async fn iris_api(seen: Hits) -> String {
    let challenges = seen.clone();
    let verifies = seen.clone();
    let checks = seen;
    let router = Router::new()
        .route(
            "/api/iris/auth/challenge",
            post(move |uri: Uri| {
                let challenges = challenges.clone();
                async move {
                    assert_eq!(server_path(&uri), "/iris/auth/challenge");
                    challenges.bump();
                    Json(json!({
                        "success": true,
                        "challenge": "c-wire",
                        "expiresAt": chrono::Utc::now().timestamp_millis() + 60_000,
                    }))
                }
            }),
        )
        .route(
            "/api/iris/auth/verify",
            post(move |uri: Uri, body: Bytes| {
                let verifies = verifies.clone();
                async move {
                    assert_eq!(server_path(&uri), "/iris/auth/verify");
                    verifies.bump();
                    let solution: ChallengeSolution = serde_json::from_slice(&body).unwrap();
                    let client = MessageAuthenticator::new(&SecretString::new(CLIENT_SECRET)).unwrap();
                    let signed = serde_json::to_vec(&solution.payload).unwrap();
                    let accepted = client.verify_hex(&signed, &solution.signature)
                        && solution.payload.challenge == "c-wire"
                        && solution.payload.hardware_id == HWID;
                    Json(json!({ "success": accepted, "sessionToken": "sess-wire" }))
                }
            }),
        )
        .route(
            "/api/iris/updates/check",
            post(move |uri: Uri| {
                let checks = checks.clone();
                async move {
                    assert_eq!(server_path(&uri), "/iris/updates/check");
                    checks.bump();
                    Json(json!({
                        "success": true,
                        "updateAvailable": true,
                        "version": "2.0.0",
                        "downloadUrl": "https://cdn.example.test/iris-setup.exe",
                        "fileHash": FILE_HASH,
                        "mandatory": false,
                    }))
                }
            }),
        )
        .layer(from_fn(server_signatures));
    spawn_server(router).await
}

fn enforcing(origin: &str, root: &Path) -> TrustConfig {
    std::fs::write(root.join("iris.bin"), b"client build").unwrap();
    TrustConfig {
        response_signature_policy: ResponseSignaturePolicy::Enforce,
        ..config_for(origin, root)
    }
}

fn updater(config: &TrustConfig) -> UpdateManager {
    UpdateManager::new(
        config,
        Arc::new(SecureChannel::new(config).unwrap()),
        Arc::new(NeverUpdate),
        Arc::new(RecordingLauncher::default()),
        Arc::new(RecordingExit::default()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_challenge_verify_and_update_check_pass_server_signing() {
    let seen = Hits::default();
    let origin = iris_api(seen.clone()).await;
    let root = tempfile::tempdir().unwrap();
    let config = enforcing(&origin, root.path());

    let protocol = AuthenticationProtocol::new(
        &config,
        Arc::new(SecureChannel::new(&config).unwrap()),
        identity(HWID, true),
        IntegrityAttestor::system(&config),
    )
    .unwrap();
    let outcome = protocol.run("bearer").await;
    assert_eq!(
        outcome,
        AuthOutcome::Authenticated {
            session_token: "sess-wire".into(),
            expires_at: None,
        }
    );

    let manifest = updater(&config).check().await.unwrap().unwrap();
    assert_eq!(manifest.version, "2.0.0");
    assert_eq!(manifest.file_hash, FILE_HASH);

    assert_eq!(seen.count(), 3);
}

#[tokio::test]
async fn test_reply_signed_over_endpoint_path_is_rejected() {
    let router = Router::new().route(
        "/api/iris/updates/check",
        post(|| async {
            let body = br#"{"success":true,"updateAvailable":false}"#;
            (StatusCode::OK, signed_headers("/updates/check", body), body.as_slice()).into_response()
        }),
    );
    let origin = spawn_server(router).await;
    let root = tempfile::tempdir().unwrap();

    let err = updater(&enforcing(&origin, root.path())).check().await.unwrap_err();
    assert!(matches!(err, TrustError::IntegrityMismatch { .. }), "{err:?}");
}
