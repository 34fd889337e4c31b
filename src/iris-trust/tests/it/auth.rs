//! Challenge-response exchange against a local mock server.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use iris_crypto::{MessageAuthenticator, SecretString};
use iris_trust::types::ChallengeSolution;
use iris_trust::{AuthOutcome, AuthState, AuthenticationProtocol, IntegrityAttestor, SecureChannel};
use serde_json::{json, Value};

use crate::common::{config_for, dead_origin, identity, server_signatures, spawn_server, Hits, CLIENT_SECRET};

const HWID: &str = "0123ABCD";

/// Mock auth server behind the request-signature layer. `challenge_reply` is
/// returned verbatim; `/auth/verify` checks the solution signature and answers
/// with `verify_reply` when it holds.
async fn auth_server(challenge_reply: Value, verify_reply: Value, challenges: Hits, verifies: Hits) -> String {
    let router = Router::new()
        .route(
            "/api/iris/auth/challenge",
            post(move || {
                let reply = challenge_reply.clone();
                let challenges = challenges.clone();
                async move {
                    challenges.bump();
                    Json(reply)
                }
            }),
        )
        .route(
            "/api/iris/auth/verify",
            post(move |body: Bytes| {
                let reply = verify_reply.clone();
                let verifies = verifies.clone();
                async move {
                    verifies.bump();
                    let Ok(solution) = serde_json::from_slice::<ChallengeSolution>(&body) else {
                        return (StatusCode::BAD_REQUEST, Json(json!({ "success": false })));
                    };
                    let signed = serde_json::to_vec(&solution.payload).unwrap();
                    let client = MessageAuthenticator::new(&SecretString::new(CLIENT_SECRET)).unwrap();
                    if !client.verify_hex(&signed, &solution.signature)
                        || solution.payload.hardware_id != HWID
                    {
                        return (
                            StatusCode::OK,
                            Json(json!({ "success": false, "reason": "bad_signature" })),
                        );
                    }
                    (StatusCode::OK, Json(reply))
                }
            }),
        )
        .layer(from_fn(server_signatures));
    spawn_server(router).await
}

fn protocol(origin: &str, root: &std::path::Path) -> AuthenticationProtocol {
    std::fs::write(root.join("iris.bin"), b"client build").unwrap();
    let config = config_for(origin, root);
    let channel = Arc::new(SecureChannel::new(&config).unwrap());
    AuthenticationProtocol::new(
        &config,
        channel,
        identity(HWID, true),
        IntegrityAttestor::system(&config),
    )
    .unwrap()
}

fn challenge_expiring_in(offset: ChronoDuration) -> Value {
    json!({
        "success": true,
        "challenge": "c-9f2e",
        "expiresAt": (Utc::now() + offset).timestamp_millis(),
    })
}

#[tokio::test]
async fn test_authenticates_with_valid_solution() {
    let (challenges, verifies) = (Hits::default(), Hits::default());
    let api = auth_server(
        challenge_expiring_in(ChronoDuration::minutes(5)),
        json!({ "success": true, "sessionToken": "sess-1", "expiresAt": "2030-01-01T00:00:00Z" }),
        challenges.clone(),
        verifies.clone(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let protocol = protocol(&api, root.path());

    let outcome = protocol.run("bearer").await;

    let AuthOutcome::Authenticated {
        session_token,
        expires_at,
    } = outcome
    else {
        panic!("expected authentication, got {outcome:?}");
    };
    assert_eq!(session_token, "sess-1");
    assert!(expires_at.is_some());
    assert!(matches!(protocol.state(), AuthState::Authenticated { .. }));
    assert_eq!((challenges.count(), verifies.count()), (1, 1));
}

#[tokio::test]
async fn test_expired_challenge_is_never_submitted() {
    let (challenges, verifies) = (Hits::default(), Hits::default());
    let api = auth_server(
        challenge_expiring_in(ChronoDuration::seconds(-30)),
        json!({ "success": true, "sessionToken": "sess-1" }),
        challenges.clone(),
        verifies.clone(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let protocol = protocol(&api, root.path());

    assert_eq!(protocol.run("bearer").await, AuthOutcome::Expired);
    assert_eq!(protocol.state(), AuthState::Expired);
    assert_eq!(challenges.count(), 1);
    assert_eq!(verifies.count(), 0);
}

#[tokio::test]
async fn test_blocked_is_terminal() {
    let (challenges, verifies) = (Hits::default(), Hits::default());
    let api = auth_server(
        challenge_expiring_in(ChronoDuration::minutes(5)),
        json!({ "success": false, "reason": "banned", "message": "Cheating detected", "blocked": true }),
        challenges.clone(),
        verifies.clone(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let protocol = protocol(&api, root.path());

    let first = protocol.run("bearer").await;
    assert_eq!(
        first,
        AuthOutcome::VerificationFailed {
            reason: "banned".into(),
            message: Some("Cheating detected".into()),
            blocked: true,
        }
    );

    let second = protocol.run("bearer").await;
    assert!(matches!(second, AuthOutcome::VerificationFailed { blocked: true, .. }));
    assert_eq!((challenges.count(), verifies.count()), (1, 1));
}

#[tokio::test]
async fn test_rejected_solution_can_retry() {
    let (challenges, verifies) = (Hits::default(), Hits::default());
    let api = auth_server(
        challenge_expiring_in(ChronoDuration::minutes(5)),
        json!({ "success": false, "reason": "stale_version" }),
        challenges.clone(),
        verifies.clone(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let protocol = protocol(&api, root.path());

    assert!(!protocol.run("bearer").await.is_authenticated());
    assert_eq!(protocol.state(), AuthState::VerificationFailed { blocked: false });
    assert!(!protocol.run("bearer").await.is_authenticated());
    assert_eq!(challenges.count(), 2);
}

#[tokio::test]
async fn test_no_challenge_issued() {
    let verifies = Hits::default();
    let api = auth_server(
        json!({ "success": false, "message": "Client version not supported" }),
        json!({ "success": true, "sessionToken": "sess-1" }),
        Hits::default(),
        verifies.clone(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let protocol = protocol(&api, root.path());

    assert_eq!(
        protocol.run("bearer").await,
        AuthOutcome::ChallengeFailed {
            message: Some("Client version not supported".into())
        }
    );
    assert_eq!(protocol.state(), AuthState::ChallengeFailed);
    assert_eq!(verifies.count(), 0);
}

#[tokio::test]
async fn test_unreachable_server_is_retryable() {
    let root = tempfile::tempdir().unwrap();
    let protocol = protocol(&dead_origin().await, root.path());

    let outcome = protocol.run("bearer").await;

    assert!(matches!(outcome, AuthOutcome::NetworkError { .. }), "{outcome:?}");
    assert_eq!(protocol.state(), AuthState::Unauthenticated);
}
