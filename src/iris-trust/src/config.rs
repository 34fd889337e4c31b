//! Configuration for the Iris trust layer.
//!
//! Every component receives its settings from a [`TrustConfig`] value; no
//! endpoint, secret or version string is read from process-wide state.

use std::path::PathBuf;
use std::time::Duration;

use iris_crypto::SecretString;
use iris_hardware::IdentityConfig;

use crate::error::TrustError;

/// Production API base URL.
pub const PRODUCTION_API_URL: &str = "https://nomercy.ggsecure.io/api/iris";

/// Local development API base URL.
pub const DEVELOPMENT_API_URL: &str = "http://localhost:5000/api/iris";

/// Environment variable holding the request-signing secret.
pub const REQUEST_SECRET_ENV: &str = "IRIS_REQUEST_SECRET";

/// Environment variable holding the client-authenticity secret.
pub const CLIENT_SECRET_ENV: &str = "IRIS_CLIENT_SECRET";

/// Environment variable overriding the API base URL.
pub const API_URL_ENV: &str = "IRIS_API_URL";

/// Timeout tiers applied across the trust layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTiers {
    /// Fast local probes (TPM presence, process list).
    pub local_probe: Duration,
    /// Structured OS queries (posture signals, CIM classes).
    pub structured_query: Duration,
    /// Authenticated API calls.
    pub network: Duration,
    /// Whole update download, redirects included.
    pub download: Duration,
}

impl Default for TimeoutTiers {
    fn default() -> Self {
        Self {
            local_probe: Duration::from_secs(5),
            structured_query: Duration::from_secs(15),
            network: Duration::from_secs(30),
            download: Duration::from_secs(60),
        }
    }
}

/// What to do when a signed response does not verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseSignaturePolicy {
    /// Log a tamper warning and hand the body to the caller anyway.
    #[default]
    Warn,
    /// Reject the response with [`TrustError::IntegrityMismatch`].
    Enforce,
}

/// Configuration for the trust layer.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// Base URL every endpoint path is appended to. Requests are signed over
    /// the resulting URL path with its first `/api` removed.
    pub api_base_url: String,
    /// HMAC key for request and response signatures.
    pub request_secret: SecretString,
    /// HMAC key for challenge solutions. Distinct from `request_secret`.
    pub client_secret: SecretString,
    /// Version reported in `X-Iris-Version`, challenges and update checks.
    pub client_version: String,
    /// Platform reported to the update service.
    pub platform: String,
    /// Timeout tiers.
    pub timeouts: TimeoutTiers,
    /// Files hashed for code integrity, relative to `install_root`.
    pub critical_files: Vec<PathBuf>,
    /// Directory the critical files are resolved against.
    pub install_root: PathBuf,
    /// Refuse sessions on machines without a usable TPM 2.0.
    pub require_tpm: bool,
    /// SHA-256 fingerprints of accepted leaf certificates. Empty disables pinning.
    pub pinned_certificates: Vec<String>,
    /// Response signature handling.
    pub response_signature_policy: ResponseSignaturePolicy,
    /// Grace period before exit after handing off to an installer.
    pub install_exit_grace: Duration,
    /// Grace period before exit after a mandatory update is declined.
    pub mandatory_exit_grace: Duration,
    /// Maximum redirect hops followed by an update download.
    pub max_redirects: usize,
    /// Elapsed time above which the debugger timing probe flags an anomaly.
    pub debug_timing_threshold: Duration,
    /// Directory for the encrypted session store.
    pub data_dir: PathBuf,
    /// Delay between keep-alive pings while a session is live.
    pub heartbeat_interval: Duration,
    /// Every n-th heartbeat cycle re-collects posture and reports it when changed.
    pub report_every: u32,
}

impl Default for TrustConfig {
    fn default() -> Self {
        let (install_root, critical_files) = current_executable_layout();
        Self {
            api_base_url: PRODUCTION_API_URL.into(),
            request_secret: SecretString::default(),
            client_secret: SecretString::default(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            timeouts: TimeoutTiers::default(),
            critical_files,
            install_root,
            require_tpm: false,
            pinned_certificates: Vec::new(),
            response_signature_policy: ResponseSignaturePolicy::default(),
            install_exit_grace: Duration::from_secs(1),
            mandatory_exit_grace: Duration::from_secs(2),
            max_redirects: 5,
            debug_timing_threshold: Duration::from_millis(50),
            data_dir: default_data_dir(),
            heartbeat_interval: Duration::from_secs(120),
            report_every: 3,
        }
    }
}

impl TrustConfig {
    /// Configuration pointed at a local development server.
    #[must_use]
    pub fn development() -> Self {
        Self {
            api_base_url: DEVELOPMENT_API_URL.into(),
            ..Self::default()
        }
    }

    /// Hardware probe bounds derived from the timeout tiers.
    #[must_use]
    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig {
            local_probe_timeout: self.timeouts.local_probe,
            structured_query_timeout: self.timeouts.structured_query,
            prefer_tpm: true,
        }
    }

    /// Build a configuration from `IRIS_*` environment variables on top of
    /// the defaults.
    pub fn from_env() -> Result<Self, TrustError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(API_URL_ENV) {
            config.api_base_url = url;
        }
        if let Ok(secret) = std::env::var(REQUEST_SECRET_ENV) {
            config.request_secret = SecretString::new(secret);
        }
        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.client_secret = SecretString::new(secret);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the settings every networked component depends on.
    pub fn validate(&self) -> Result<(), TrustError> {
        if !(self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://")) {
            return Err(TrustError::config(
                format!("API base URL '{}' is not an http(s) URL", self.api_base_url),
                "Pass a full URL such as https://host/api/iris.",
            ));
        }
        if self.request_secret.is_empty() {
            return Err(TrustError::config(
                "request-signing secret is not set",
                format!("Set {REQUEST_SECRET_ENV} or pass --request-secret."),
            ));
        }
        if self.client_secret.is_empty() {
            return Err(TrustError::config(
                "client-authenticity secret is not set",
                format!("Set {CLIENT_SECRET_ENV} or pass --client-secret."),
            ));
        }
        if self.report_every == 0 {
            return Err(TrustError::config(
                "heartbeat report cadence is zero",
                "Set report_every to 1 or more.",
            ));
        }
        for pin in &self.pinned_certificates {
            let digest = pin.strip_prefix("sha256:").unwrap_or(pin);
            if digest.len() != 64 || hex::decode(digest).is_err() {
                return Err(TrustError::config(
                    format!("certificate pin '{pin}' is not a SHA-256 hex digest"),
                    "Pins are 64 hex characters, optionally prefixed with 'sha256:'.",
                ));
            }
        }
        Ok(())
    }
}

fn current_executable_layout() -> (PathBuf, Vec<PathBuf>) {
    match std::env::current_exe() {
        Ok(exe) => {
            let root = exe
                .parent()
                .map_or_else(|| PathBuf::from("."), PathBuf::from);
            let name = exe
                .file_name()
                .map_or_else(|| PathBuf::from("iris-trust"), PathBuf::from);
            (root, vec![name])
        },
        Err(_) => (PathBuf::from("."), Vec::new()),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let base = std::env::var_os("APPDATA").map(PathBuf::from);
    #[cfg(not(target_os = "windows"))]
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")));

    base.unwrap_or_else(std::env::temp_dir).join("iris")
}
