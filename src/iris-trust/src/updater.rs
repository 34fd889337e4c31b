//! Hash-verified self-update.
//!
//! ```text
//! Checking ──► UpToDate
//!    │
//!    └──► Available ──► (prompt) ──► Skipped
//!                          │   └──► MandatoryQuit ──► exit (2 s)
//!                          └──► Downloading ──► Installing ──► exit (1 s)
//! ```
//!
//! Downloads stream to a temporary file while hashing. The file is deleted
//! on every failure path, and nothing is launched unless its SHA-256 equals
//! the manifest's `fileHash`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::LOCATION;
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::channel::{user_agent, SecureChannel};
use crate::config::TrustConfig;
use crate::error::TrustError;
use crate::lifecycle::{schedule_exit, ExitHandler, ExitReason, InstallerLauncher, UpdateDecision, UpdatePrompt};
use crate::types::{Ack, UpdateCheckRequest, UpdateCheckResponse, UpdateManifest};

/// Update check endpoint.
pub const CHECK_PATH: &str = "/updates/check";

/// Published update state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// No cycle has run yet.
    Idle,
    /// Asking the server.
    Checking,
    /// Already on the latest version.
    UpToDate,
    /// A newer version exists.
    Available {
        /// New version.
        version: String,
        /// Whether it is mandatory.
        mandatory: bool,
    },
    /// Download in progress.
    Downloading {
        /// Percent complete when the size is known.
        percent: Option<u8>,
    },
    /// Installer launched; exit pending.
    Installing {
        /// Version being installed.
        version: String,
    },
    /// The user deferred an optional update.
    Skipped,
    /// The user declined a mandatory update; exit pending.
    MandatoryQuit,
    /// The cycle failed.
    Failed {
        /// What went wrong.
        message: String,
    },
}

/// Result of [`UpdateManager::perform_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheckOutcome {
    /// Nothing to do, or the cycle failed.
    NoUpdate,
    /// Optional update deferred.
    Skipped,
    /// Installer launched and exit scheduled.
    Installing,
    /// Mandatory update declined and exit scheduled.
    MandatoryDeclined,
}

/// Removes a partially written download unless kept.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Removed partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove partial download"),
            }
        }
    }
}

/// Checks for, downloads and installs updates.
pub struct UpdateManager {
    channel: Arc<SecureChannel>,
    http: Client,
    prompt: Arc<dyn UpdatePrompt>,
    launcher: Arc<dyn InstallerLauncher>,
    exit: Arc<dyn ExitHandler>,
    client_version: String,
    platform: String,
    download_timeout: Duration,
    max_redirects: usize,
    install_exit_grace: Duration,
    mandatory_exit_grace: Duration,
    download_dir: PathBuf,
    status: watch::Sender<UpdateStatus>,
    cycle: Mutex<()>,
}

impl std::fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("client_version", &self.client_version)
            .field("platform", &self.platform)
            .field("download_dir", &self.download_dir)
            .finish_non_exhaustive()
    }
}

impl UpdateManager {
    /// Create a manager.
    pub fn new(
        config: &TrustConfig,
        channel: Arc<SecureChannel>,
        prompt: Arc<dyn UpdatePrompt>,
        launcher: Arc<dyn InstallerLauncher>,
        exit: Arc<dyn ExitHandler>,
    ) -> Result<Self, TrustError> {
        let http = ClientBuilder::new()
            .connect_timeout(config.timeouts.network)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent(&config.client_version))
            .build()
            .map_err(|e| {
                TrustError::config(
                    format!("failed to create download client: {e}"),
                    "Check TLS support on this system.",
                )
            })?;
        let (status, _) = watch::channel(UpdateStatus::Idle);

        Ok(Self {
            channel,
            http,
            prompt,
            launcher,
            exit,
            client_version: config.client_version.clone(),
            platform: config.platform.clone(),
            download_timeout: config.timeouts.download,
            max_redirects: config.max_redirects,
            install_exit_grace: config.install_exit_grace,
            mandatory_exit_grace: config.mandatory_exit_grace,
            download_dir: std::env::temp_dir(),
            status,
            cycle: Mutex::new(()),
        })
    }

    /// Write downloads somewhere other than the system temp directory.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> UpdateStatus {
        self.status.borrow().clone()
    }

    fn publish(&self, status: UpdateStatus) {
        debug!(status = ?status, "Update status");
        self.status.send_replace(status);
    }

    /// Ask the server whether a newer build exists.
    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<Option<UpdateManifest>, TrustError> {
        let request = UpdateCheckRequest {
            version: self.client_version.clone(),
            platform: self.platform.clone(),
        };
        let response: UpdateCheckResponse = self.channel.post_json(CHECK_PATH, &request, None).await?;
        let manifest = response.into_manifest()?;
        match &manifest {
            Some(m) => info!(version = %m.version, mandatory = m.mandatory, "Update available"),
            None => info!("No update available"),
        }
        Ok(manifest)
    }

    /// Download `url` and verify it against `expected_hash`.
    ///
    /// Redirects restart against `Location` with the same expected hash.
    /// The whole operation, redirects included, is bounded by the download
    /// timeout. Returns the path of the verified file.
    #[instrument(skip(self, on_progress))]
    pub async fn download<F>(&self, url: &str, expected_hash: &str, mut on_progress: F) -> Result<PathBuf, TrustError>
    where
        F: FnMut(u8) + Send,
    {
        match tokio::time::timeout(
            self.download_timeout,
            self.download_following_redirects(url, expected_hash, &mut on_progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(url = %url, "Download timed out");
                Err(TrustError::Unreachable {
                    message: format!("download of {url} timed out after {}s", self.download_timeout.as_secs()),
                })
            },
        }
    }

    async fn download_following_redirects<F>(
        &self,
        url: &str,
        expected_hash: &str,
        on_progress: &mut F,
    ) -> Result<PathBuf, TrustError>
    where
        F: FnMut(u8) + Send,
    {
        let mut current = Url::parse(url).map_err(|e| TrustError::Update {
            message: format!("invalid download URL '{url}': {e}"),
        })?;

        for hop in 0..=self.max_redirects {
            let response = self.http.get(current.clone()).send().await.map_err(|e| {
                warn!(url = %current, error = %e, "Download request failed");
                TrustError::Unreachable {
                    message: format!("download from {current} failed: {e}"),
                }
            })?;
            let status = response.status();

            if is_followed_redirect(status) {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| TrustError::Update {
                        message: format!("redirect {status} without Location header"),
                    })?;
                let next = current.join(location).map_err(|e| TrustError::Update {
                    message: format!("invalid redirect target '{location}': {e}"),
                })?;
                debug!(hop, from = %current, to = %next, "Following download redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                warn!(url = %current, status = %status, "Download failed");
                return Err(TrustError::Update {
                    message: format!("download failed: HTTP {}", status.as_u16()),
                });
            }

            return self.stream_to_file(response, expected_hash, on_progress).await;
        }

        Err(TrustError::Update {
            message: format!("more than {} redirects", self.max_redirects),
        })
    }

    async fn stream_to_file<F>(
        &self,
        mut response: reqwest::Response,
        expected_hash: &str,
        on_progress: &mut F,
    ) -> Result<PathBuf, TrustError>
    where
        F: FnMut(u8) + Send,
    {
        let total = response.content_length().filter(|t| *t > 0);
        let path = self.download_dir.join(format!(
            "iris-update-{}{}",
            Utc::now().timestamp_millis(),
            std::env::consts::EXE_SUFFIX
        ));
        let guard = PartialFile::new(path.clone());
        let mut file = tokio::fs::File::create(&path).await?;
        info!(path = %path.display(), total = ?total, "Downloading update");

        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        let mut last_percent = None;
        self.publish(UpdateStatus::Downloading { percent: total.map(|_| 0) });

        while let Some(chunk) = response.chunk().await.map_err(|e| TrustError::Unreachable {
            message: format!("download interrupted: {e}"),
        })? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if let Some(total) = total {
                let percent = u8::try_from((received.saturating_mul(100) / total).min(100)).unwrap_or(100);
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    on_progress(percent);
                    self.publish(UpdateStatus::Downloading { percent: Some(percent) });
                }
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if !iris_crypto::hex_digest_eq(&actual, expected_hash) {
            warn!(
                expected = %expected_hash,
                actual = %actual,
                bytes = received,
                "Update hash mismatch, discarding download"
            );
            return Err(TrustError::integrity(format!(
                "update hash mismatch: expected {expected_hash}, got {actual}"
            )));
        }

        info!(path = %path.display(), bytes = received, "Download complete, hash verified");
        Ok(guard.keep())
    }

    /// Launch a verified installer and schedule exit after the install grace.
    #[instrument(skip(self))]
    pub async fn install(&self, path: &Path, version: &str) -> Result<(), TrustError> {
        self.launcher.launch(path).await?;
        self.publish(UpdateStatus::Installing {
            version: version.to_string(),
        });
        schedule_exit(Arc::clone(&self.exit), ExitReason::UpdateInstalling, self.install_exit_grace);
        Ok(())
    }

    /// Run one complete update cycle.
    ///
    /// Errors degrade to [`UpdateCheckOutcome::NoUpdate`]. Concurrent calls
    /// are serialized.
    #[instrument(skip(self))]
    pub async fn perform_check(&self) -> UpdateCheckOutcome {
        let _cycle = self.cycle.lock().await;
        match self.run_cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, integrity = e.is_integrity_violation(), "Update cycle failed");
                self.publish(UpdateStatus::Failed { message: e.to_string() });
                UpdateCheckOutcome::NoUpdate
            },
        }
    }

    async fn run_cycle(&self) -> Result<UpdateCheckOutcome, TrustError> {
        self.publish(UpdateStatus::Checking);
        let Some(manifest) = self.check().await? else {
            self.publish(UpdateStatus::UpToDate);
            return Ok(UpdateCheckOutcome::NoUpdate);
        };

        self.publish(UpdateStatus::Available {
            version: manifest.version.clone(),
            mandatory: manifest.mandatory,
        });

        if self.prompt.decide(&manifest).await == UpdateDecision::Decline {
            if manifest.mandatory {
                warn!(version = %manifest.version, "Mandatory update declined");
                self.publish(UpdateStatus::MandatoryQuit);
                schedule_exit(
                    Arc::clone(&self.exit),
                    ExitReason::MandatoryUpdateDeclined,
                    self.mandatory_exit_grace,
                );
                return Ok(UpdateCheckOutcome::MandatoryDeclined);
            }
            info!(version = %manifest.version, "Update deferred");
            self.publish(UpdateStatus::Skipped);
            return Ok(UpdateCheckOutcome::Skipped);
        }

        let prompt = Arc::clone(&self.prompt);
        let path = self
            .download(&manifest.download_url, &manifest.file_hash, move |percent| prompt.progress(percent))
            .await?;

        self.report_downloaded(&manifest.version).await;
        if let Err(e) = self.install(&path, &manifest.version).await {
            // The verified installer is of no further use if it cannot run.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(UpdateCheckOutcome::Installing)
    }

    /// Best-effort download telemetry.
    async fn report_downloaded(&self, version: &str) {
        let path = format!("/updates/{version}/downloaded");
        if let Err(e) = self.channel.post_empty::<Ack>(&path, None).await {
            debug!(error = %e, "Download telemetry not delivered");
        }
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}
