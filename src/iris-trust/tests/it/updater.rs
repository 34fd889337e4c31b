//! Update download and cycle tests against a local mock server.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Json, Router};
use iris_trust::{
    AutoAccept, ExitReason, NeverUpdate, SecureChannel, TrustConfig, UpdateCheckOutcome, UpdateManager, UpdateStatus,
};
use serde_json::json;

use crate::common::{
    config_for, dead_origin, files_in, server_signatures, spawn_server, Hits, RecordingExit, RecordingLauncher,
};

const PAYLOAD: &[u8] = b"MZ\x90\x00 pretend this is an installer";

fn payload_hash() -> String {
    iris_crypto::sha256_hex(PAYLOAD)
}

/// Serves the installer at `/files/installer`, plus redirect and error routes.
async fn file_server(hits: Hits) -> String {
    let router = Router::new()
        .route(
            "/files/installer",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.bump();
                    PAYLOAD
                }
            }),
        )
        .route(
            "/files/moved",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/files/installer")]) }),
        )
        .route(
            "/files/loop",
            get(|| async { (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/files/loop")]) }),
        )
        .route("/files/missing", get(|| async { StatusCode::NOT_FOUND }));
    spawn_server(router).await
}

/// Serves `/updates/check` with the given reply and counts telemetry posts.
async fn api_server(check_reply: serde_json::Value, telemetry: Hits) -> String {
    let router = Router::new()
        .route(
            "/api/iris/updates/check",
            post(move || {
                let reply = check_reply.clone();
                async move { Json(reply) }
            }),
        )
        .route(
            "/api/iris/updates/:version/downloaded",
            post(move || {
                let telemetry = telemetry.clone();
                async move {
                    telemetry.bump();
                    Json(json!({ "success": true }))
                }
            }),
        )
        .layer(from_fn(server_signatures));
    spawn_server(router).await
}

fn update_reply(files: &str, mandatory: bool, file_hash: &str) -> serde_json::Value {
    json!({
        "success": true,
        "updateAvailable": true,
        "version": "2.0.0",
        "downloadUrl": format!("{files}/files/installer"),
        "fileSize": PAYLOAD.len(),
        "fileHash": file_hash,
        "changelog": "Bug fixes",
        "mandatory": mandatory,
    })
}

struct Harness {
    manager: UpdateManager,
    launcher: Arc<RecordingLauncher>,
    exit: Arc<RecordingExit>,
    download_dir: tempfile::TempDir,
    _root: tempfile::TempDir,
}

fn harness(config: &TrustConfig, root: tempfile::TempDir, accept: bool) -> Harness {
    let download_dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(RecordingLauncher::default());
    let exit = Arc::new(RecordingExit::default());
    let channel = Arc::new(SecureChannel::new(config).unwrap());
    let manager = if accept {
        UpdateManager::new(config, channel, Arc::new(AutoAccept), launcher.clone(), exit.clone())
    } else {
        UpdateManager::new(config, channel, Arc::new(NeverUpdate), launcher.clone(), exit.clone())
    }
    .unwrap()
    .with_download_dir(download_dir.path());

    Harness {
        manager,
        launcher,
        exit,
        download_dir,
        _root: root,
    }
}

async fn download_harness() -> (Harness, String, Hits) {
    let hits = Hits::default();
    let files = file_server(hits.clone()).await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&dead_origin().await, root.path());
    (harness(&config, root, true), files, hits)
}

// =============================================================================
// Download
// =============================================================================

#[tokio::test]
async fn test_download_accepts_matching_hash() {
    let (h, files, _) = download_harness().await;
    let mut progress = Vec::new();

    let path = h
        .manager
        .download(
            &format!("{files}/files/installer"),
            &payload_hash().to_uppercase(),
            |p| progress.push(p),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), PAYLOAD);
    assert!(path.starts_with(h.download_dir.path()));
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("iris-update-"));
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn test_download_rejects_mismatch_and_removes_file() {
    let (h, files, _) = download_harness().await;
    let wrong = iris_crypto::sha256_hex(b"something else");

    let err = h
        .manager
        .download(&format!("{files}/files/installer"), &wrong, |_| {})
        .await
        .unwrap_err();

    assert!(err.is_integrity_violation());
    assert!(files_in(h.download_dir.path()).is_empty());
}

#[tokio::test]
async fn test_download_follows_redirect() {
    let (h, files, hits) = download_harness().await;

    let path = h
        .manager
        .download(&format!("{files}/files/moved"), &payload_hash(), |_| {})
        .await
        .unwrap();

    assert_eq!(std::fs::read(path).unwrap(), PAYLOAD);
    assert_eq!(hits.count(), 1);
}

#[tokio::test]
async fn test_download_http_error_leaves_nothing() {
    let (h, files, _) = download_harness().await;

    let err = h
        .manager
        .download(&format!("{files}/files/missing"), &payload_hash(), |_| {})
        .await
        .unwrap_err();

    assert!(err.to_string().contains("HTTP 404"), "{err}");
    assert!(files_in(h.download_dir.path()).is_empty());
}

#[tokio::test]
async fn test_download_redirect_loop_is_bounded() {
    let (h, files, _) = download_harness().await;

    let err = h
        .manager
        .download(&format!("{files}/files/loop"), &payload_hash(), |_| {})
        .await
        .unwrap_err();

    assert!(err.to_string().contains("redirects"), "{err}");
    assert!(files_in(h.download_dir.path()).is_empty());
}

// =============================================================================
// Full cycle
// =============================================================================

#[tokio::test]
async fn test_cycle_installs_verified_update() {
    let file_hits = Hits::default();
    let telemetry = Hits::default();
    let files = file_server(file_hits.clone()).await;
    let api = api_server(update_reply(&files, false, &payload_hash()), telemetry.clone()).await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let h = harness(&config, root, true);

    let outcome = h.manager.perform_check().await;

    assert_eq!(outcome, UpdateCheckOutcome::Installing);
    assert_eq!(
        h.manager.status(),
        UpdateStatus::Installing {
            version: "2.0.0".into()
        }
    );
    let launched = h.launcher.launched.lock().unwrap().clone();
    assert_eq!(launched.len(), 1);
    assert_eq!(std::fs::read(&launched[0]).unwrap(), PAYLOAD);
    assert_eq!(file_hits.count(), 1);
    assert_eq!(telemetry.count(), 1);
    assert_eq!(*h.exit.requested.lock().unwrap(), vec![ExitReason::UpdateInstalling]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*h.exit.confirmed.lock().unwrap(), vec![ExitReason::UpdateInstalling]);
}

#[tokio::test]
async fn test_cycle_mandatory_decline_schedules_exit() {
    let file_hits = Hits::default();
    let files = file_server(file_hits.clone()).await;
    let api = api_server(update_reply(&files, true, &payload_hash()), Hits::default()).await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let h = harness(&config, root, false);

    let outcome = h.manager.perform_check().await;

    assert_eq!(outcome, UpdateCheckOutcome::MandatoryDeclined);
    assert_eq!(h.manager.status(), UpdateStatus::MandatoryQuit);
    assert_eq!(
        *h.exit.requested.lock().unwrap(),
        vec![ExitReason::MandatoryUpdateDeclined]
    );
    assert_eq!(file_hits.count(), 0);
    assert!(h.launcher.launched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cycle_optional_decline_skips() {
    let file_hits = Hits::default();
    let files = file_server(file_hits.clone()).await;
    let api = api_server(update_reply(&files, false, &payload_hash()), Hits::default()).await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let h = harness(&config, root, false);

    assert_eq!(h.manager.perform_check().await, UpdateCheckOutcome::Skipped);
    assert_eq!(h.manager.status(), UpdateStatus::Skipped);
    assert!(h.exit.requested.lock().unwrap().is_empty());
    assert_eq!(file_hits.count(), 0);
}

#[tokio::test]
async fn test_cycle_hash_mismatch_never_launches() {
    let files = file_server(Hits::default()).await;
    let telemetry = Hits::default();
    let api = api_server(
        update_reply(&files, true, &iris_crypto::sha256_hex(b"tampered")),
        telemetry.clone(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let h = harness(&config, root, true);

    assert_eq!(h.manager.perform_check().await, UpdateCheckOutcome::NoUpdate);
    assert!(matches!(h.manager.status(), UpdateStatus::Failed { .. }));
    assert!(h.launcher.launched.lock().unwrap().is_empty());
    assert!(h.exit.requested.lock().unwrap().is_empty());
    assert_eq!(telemetry.count(), 0);
    assert!(files_in(h.download_dir.path()).is_empty());
}

#[tokio::test]
async fn test_cycle_up_to_date() {
    let api = api_server(json!({ "success": true, "updateAvailable": false }), Hits::default()).await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let h = harness(&config, root, true);

    assert_eq!(h.manager.perform_check().await, UpdateCheckOutcome::NoUpdate);
    assert_eq!(h.manager.status(), UpdateStatus::UpToDate);
}

#[tokio::test]
async fn test_cycle_server_down_degrades_to_no_update() {
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&dead_origin().await, root.path());
    let h = harness(&config, root, true);

    assert_eq!(h.manager.perform_check().await, UpdateCheckOutcome::NoUpdate);
    assert!(matches!(h.manager.status(), UpdateStatus::Failed { .. }));
}

#[tokio::test]
async fn test_cycle_incomplete_mandatory_manifest_fails() {
    let api = api_server(
        json!({ "success": true, "updateAvailable": true, "version": "2.0.0", "mandatory": true }),
        Hits::default(),
    )
    .await;
    let root = tempfile::tempdir().unwrap();
    let config = config_for(&api, root.path());
    let h = harness(&config, root, true);

    assert_eq!(h.manager.perform_check().await, UpdateCheckOutcome::NoUpdate);
    let UpdateStatus::Failed { message } = h.manager.status() else {
        panic!("expected failure, got {:?}", h.manager.status());
    };
    assert!(message.contains("downloadUrl, fileHash"), "{message}");
    assert!(h.exit.requested.lock().unwrap().is_empty());
    assert!(h.launcher.launched.lock().unwrap().is_empty());
}
