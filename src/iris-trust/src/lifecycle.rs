//! Collaborators owned by the hosting shell.
//!
//! The trust layer never exits the process or shows UI itself. It asks:
//!
//! - [`UpdatePrompt`] whether to take an update,
//! - [`InstallerLauncher`] to start a verified installer,
//! - [`ExitHandler`] to quit, in two phases: `request_exit` immediately,
//!   then `confirm_exit` once the grace period has passed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::TrustError;
use crate::types::UpdateManifest;

/// Why the client is asking to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// An installer has been launched and needs the binary released.
    UpdateInstalling,
    /// The user declined a mandatory update.
    MandatoryUpdateDeclined,
}

impl ExitReason {
    /// Short label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateInstalling => "update_installing",
            Self::MandatoryUpdateDeclined => "mandatory_update_declined",
        }
    }
}

/// Receives process-exit requests.
pub trait ExitHandler: Send + Sync {
    /// Exit has been scheduled; `grace` is how long until it is confirmed.
    fn request_exit(&self, reason: ExitReason, grace: Duration);

    /// The grace period has elapsed; the host should quit now.
    fn confirm_exit(&self, reason: ExitReason);
}

/// Request an exit now and confirm it after `grace` on a background task.
pub fn schedule_exit(handler: Arc<dyn ExitHandler>, reason: ExitReason, grace: Duration) {
    info!(reason = reason.as_str(), grace_ms = grace.as_millis() as u64, "Exit requested");
    handler.request_exit(reason, grace);
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        info!(reason = reason.as_str(), "Exit confirmed");
        handler.confirm_exit(reason);
    });
}

/// Exits the process on confirmation. Used by the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl ExitHandler for ProcessExit {
    fn request_exit(&self, reason: ExitReason, grace: Duration) {
        info!(reason = reason.as_str(), grace_ms = grace.as_millis() as u64, "Process will exit");
    }

    fn confirm_exit(&self, reason: ExitReason) {
        let code = match reason {
            ExitReason::UpdateInstalling => 0,
            ExitReason::MandatoryUpdateDeclined => 3,
        };
        std::process::exit(code);
    }
}

/// Starts an installer without waiting for it.
#[async_trait]
pub trait InstallerLauncher: Send + Sync {
    /// Launch the installer at `path`.
    async fn launch(&self, path: &Path) -> Result<(), TrustError>;
}

/// Spawns the installer as a detached child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInstallerLauncher;

#[async_trait]
impl InstallerLauncher for SystemInstallerLauncher {
    async fn launch(&self, path: &Path) -> Result<(), TrustError> {
        let mut command = std::process::Command::new(path);
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            command.creation_flags(DETACHED_PROCESS);
        }
        let child = command.spawn().map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to launch installer");
            TrustError::Update {
                message: format!("failed to launch installer {}: {e}", path.display()),
            }
        })?;
        info!(path = %path.display(), pid = child.id(), "Installer launched");
        Ok(())
    }
}

/// The user's answer to an update prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Download and install now.
    Accept,
    /// Not now. For a mandatory update this means quitting.
    Decline,
}

/// Asks the user about an available update.
///
/// Mandatory updates present a single acknowledgement action; optional
/// updates offer accept or defer.
#[async_trait]
pub trait UpdatePrompt: Send + Sync {
    /// Ask about `manifest`.
    async fn decide(&self, manifest: &UpdateManifest) -> UpdateDecision;

    /// Report download progress, 0-100. Unknown totals are never reported.
    fn progress(&self, _percent: u8) {}
}

/// Accepts every update without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAccept;

#[async_trait]
impl UpdatePrompt for AutoAccept {
    async fn decide(&self, manifest: &UpdateManifest) -> UpdateDecision {
        info!(version = %manifest.version, "Accepting update");
        UpdateDecision::Accept
    }
}

/// Declines every update. Used for check-only runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverUpdate;

#[async_trait]
impl UpdatePrompt for NeverUpdate {
    async fn decide(&self, _manifest: &UpdateManifest) -> UpdateDecision {
        UpdateDecision::Decline
    }
}
