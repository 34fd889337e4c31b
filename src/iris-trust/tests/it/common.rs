//! Shared fixtures: a local mock API server, a scripted hardware probe and
//! recording lifecycle collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use iris_crypto::RequestSigner;
use iris_hardware::{
    BiosDescriptor, BoardDescriptor, CpuDescriptor, HardwareError, HardwareProbe, OsDescriptor, SystemDescriptor,
};
use iris_trust::config::TimeoutTiers;
use iris_trust::{
    ExitHandler, ExitReason, HardwareIdentity, IdentityConfig, InstallerLauncher, SecretString, TrustConfig,
    TrustError,
};

pub const REQUEST_SECRET: &str = "test-request-secret";
pub const CLIENT_SECRET: &str = "test-client-secret";
pub const API_PREFIX: &str = "/api/iris";

/// Serve `router` on an ephemeral local port and return its origin.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// An origin nothing is listening on.
pub async fn dead_origin() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Configuration pointed at `origin` with short timeouts.
pub fn config_for(origin: &str, root: &Path) -> TrustConfig {
    TrustConfig {
        api_base_url: format!("{origin}{API_PREFIX}"),
        request_secret: SecretString::new(REQUEST_SECRET),
        client_secret: SecretString::new(CLIENT_SECRET),
        client_version: "1.0.0".into(),
        platform: "windows".into(),
        timeouts: TimeoutTiers {
            local_probe: Duration::from_secs(1),
            structured_query: Duration::from_secs(2),
            network: Duration::from_secs(5),
            download: Duration::from_secs(10),
        },
        install_root: root.to_path_buf(),
        critical_files: vec![PathBuf::from("iris.bin")],
        install_exit_grace: Duration::from_millis(20),
        mandatory_exit_grace: Duration::from_millis(20),
        data_dir: root.join("data"),
        ..TrustConfig::default()
    }
}

// =============================================================================
// Server-side signatures
// =============================================================================

fn signer() -> RequestSigner {
    RequestSigner::new(&SecretString::new(REQUEST_SECRET)).unwrap()
}

/// The path the server signs: the request path with its first `/api` removed.
pub fn server_path(uri: &Uri) -> String {
    uri.path().replacen("/api", "", 1)
}

/// Whether the request carries a valid signature over `path`.
pub fn request_signed(method: &Method, headers: &HeaderMap, path: &str, body: &[u8]) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(ts), Some(nonce), Some(sig)) = (
        header("X-Iris-Timestamp").and_then(|t| t.parse::<i64>().ok()),
        header("X-Iris-Nonce"),
        header("X-Iris-Signature"),
    ) else {
        return false;
    };
    signer()
        .verify_request(
            method.as_str(),
            path,
            ts,
            nonce,
            body,
            sig,
            chrono::Utc::now().timestamp_millis(),
            iris_crypto::DEFAULT_TIMESTAMP_TOLERANCE_MS,
        )
        .is_ok()
}

/// Response signature headers over `body` for server path `path`.
pub fn signed_headers(path: &str, body: &[u8]) -> HeaderMap {
    let timestamp = chrono::Utc::now().timestamp_millis().to_string();
    let mut headers = HeaderMap::new();
    headers.insert(
        "X-Iris-Response-Signature",
        signer().sign_response(path, &timestamp, body).parse().unwrap(),
    );
    headers.insert("X-Iris-Response-Timestamp", timestamp.parse().unwrap());
    headers
}

/// Middleware behaving like the API's signature layer.
///
/// Requests are verified against the path derived from their URI, rejected
/// with 401 on mismatch, and replies are signed over the same path unless the
/// handler already set a signature.
pub async fn server_signatures(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let path = server_path(&parts.uri);
    let bytes = to_bytes(body, usize::MAX).await.unwrap();

    if !request_signed(&parts.method, &parts.headers, &path, &bytes) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "success": false,
                "message": "Invalid request signature",
                "serverPath": path,
            })),
        )
            .into_response();
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    let (mut parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    if !parts.headers.contains_key("X-Iris-Response-Signature") {
        for (name, value) in signed_headers(&path, &bytes) {
            if let Some(name) = name {
                parts.headers.insert(name, value);
            }
        }
    }
    Response::from_parts(parts, Body::from(bytes))
}

// =============================================================================
// Hardware
// =============================================================================

/// Probe that reports a TPM with a fixed endorsement key.
pub struct ScriptedProbe {
    pub tpm: bool,
    pub endorsement_key: String,
}

#[async_trait]
impl HardwareProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn tpm_present(&self) -> Result<bool, HardwareError> {
        Ok(self.tpm)
    }

    async fn tpm_endorsement_key_hash(&self) -> Result<Option<String>, HardwareError> {
        Ok(Some(self.endorsement_key.clone()))
    }

    async fn cpu(&self) -> Result<CpuDescriptor, HardwareError> {
        Ok(CpuDescriptor {
            manufacturer: "AuthenticAMD".into(),
            brand: "AMD Ryzen 7 7800X3D".into(),
            cores: 16,
        })
    }

    async fn system(&self) -> Result<SystemDescriptor, HardwareError> {
        Ok(SystemDescriptor {
            manufacturer: "ASUS".into(),
            model: "ROG".into(),
            uuid: "03000200-0400-0500-0006-000700080009".into(),
        })
    }

    async fn baseboard(&self) -> Result<BoardDescriptor, HardwareError> {
        Ok(BoardDescriptor {
            manufacturer: "ASUSTeK".into(),
            model: "ROG STRIX B650E-F".into(),
            serial: "MB-1234".into(),
        })
    }

    async fn bios(&self) -> Result<BiosDescriptor, HardwareError> {
        Ok(BiosDescriptor {
            vendor: "American Megatrends Inc.".into(),
            serial: "System Serial Number".into(),
        })
    }

    async fn first_disk_serial(&self) -> Result<Option<String>, HardwareError> {
        Ok(Some("S6B0NL0W123456".into()))
    }

    async fn machine_id(&self) -> Result<String, HardwareError> {
        Ok("0f3c7a5e-1d2b-4c6a-9e8f-7a6b5c4d3e2f".into())
    }

    async fn os(&self) -> Result<OsDescriptor, HardwareError> {
        Ok(OsDescriptor {
            platform: "windows".into(),
            distro: "Microsoft Windows 11 Home".into(),
            release: "10.0.22631".into(),
            arch: "x64".into(),
        })
    }

    async fn total_memory_bytes(&self) -> Result<u64, HardwareError> {
        Ok(32 * 1024 * 1024 * 1024)
    }
}

/// Identity whose hardware id is the uppercase `endorsement_key`.
pub fn identity(endorsement_key: &str, tpm: bool) -> HardwareIdentity {
    HardwareIdentity::new(
        Arc::new(ScriptedProbe {
            tpm,
            endorsement_key: endorsement_key.into(),
        }),
        IdentityConfig::default(),
    )
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Records exit requests without exiting.
#[derive(Default)]
pub struct RecordingExit {
    pub requested: Mutex<Vec<ExitReason>>,
    pub confirmed: Mutex<Vec<ExitReason>>,
}

impl ExitHandler for RecordingExit {
    fn request_exit(&self, reason: ExitReason, _grace: Duration) {
        self.requested.lock().unwrap().push(reason);
    }

    fn confirm_exit(&self, reason: ExitReason) {
        self.confirmed.lock().unwrap().push(reason);
    }
}

/// Records launched installers without running them.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launched: Mutex<Vec<PathBuf>>,
    pub fail: bool,
}

#[async_trait]
impl InstallerLauncher for RecordingLauncher {
    async fn launch(&self, path: &Path) -> Result<(), TrustError> {
        if self.fail {
            return Err(TrustError::Update {
                message: "launch refused".into(),
            });
        }
        self.launched.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// Shared request counter for mock routes.
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Files currently in `dir`.
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}
