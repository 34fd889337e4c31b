//! Keep-alive pings and posture reports for a live session.
//!
//! ```text
//! run():
//!   report(force)                  initial posture, always sent
//!   every heartbeat_interval:
//!     no stored session      ──► stop
//!     POST /ping
//!     every report_every-th cycle, or every cycle in scan mode:
//!       report()
//!         posture == last sent ──► Unchanged (nothing sent)
//!         posture moved        ──► POST /heartbeat {security, systemInfo.securityChanges, verification}
//! ```
//!
//! The baseline for change detection is the last posture the server
//! accepted. A failed send leaves it in place, so the next cycle retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iris_hardware::HardwareIdentity;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::channel::SecureChannel;
use crate::config::TrustConfig;
use crate::error::TrustError;
use crate::security::{IntegrityAttestor, ParsedPosture};
use crate::session::SessionManager;
use crate::types::{Ack, HeartbeatReply, HeartbeatRequest, HeartbeatSystemInfo};

/// Keep-alive endpoint.
pub const PING_PATH: &str = "/ping";

/// Posture report endpoint.
pub const HEARTBEAT_PATH: &str = "/heartbeat";

/// Result of one report attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The posture was sent and accepted.
    Sent {
        /// Transitions since the previous report. Empty for the first one.
        changes: Vec<String>,
    },
    /// The posture matched the last report; nothing was sent.
    Unchanged,
}

/// Describe every posture signal that differs between two snapshots.
#[must_use]
pub fn posture_changes(previous: &ParsedPosture, current: &ParsedPosture) -> Vec<String> {
    let flags = [
        ("TPM Present", previous.tpm.present, current.tpm.present),
        ("TPM Enabled", previous.tpm.enabled, current.tpm.enabled),
        ("Secure Boot", previous.secure_boot, current.secure_boot),
        ("Virtualization", previous.virtualization, current.virtualization),
        ("IOMMU", previous.iommu, current.iommu),
        ("VBS", previous.vbs, current.vbs),
        ("HVCI", previous.hvci, current.hvci),
        ("Defender", previous.defender, current.defender),
        ("Defender Real-time", previous.defender_realtime, current.defender_realtime),
        ("Disk Encryption", previous.disk_encryption, current.disk_encryption),
    ];

    let mut changes: Vec<String> = flags
        .iter()
        .filter(|(_, before, after)| before != after)
        .map(|(name, before, after)| format!("{name}: {before} -> {after}"))
        .collect();
    if previous.tpm.version != current.tpm.version {
        changes.push(format!(
            "TPM Version: {} -> {}",
            previous.tpm.version.as_deref().unwrap_or("none"),
            current.tpm.version.as_deref().unwrap_or("none"),
        ));
    }
    changes
}

/// Sends keep-alives and reports posture changes over the secure channel.
pub struct HeartbeatService {
    channel: Arc<SecureChannel>,
    identity: HardwareIdentity,
    attestor: IntegrityAttestor,
    interval: Duration,
    report_every: u32,
    last_sent: Mutex<Option<ParsedPosture>>,
    scan_mode: AtomicBool,
}

impl std::fmt::Debug for HeartbeatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatService")
            .field("interval", &self.interval)
            .field("report_every", &self.report_every)
            .field("scan_mode", &self.scan_mode())
            .finish_non_exhaustive()
    }
}

impl HeartbeatService {
    /// Create a service with no posture reported yet.
    pub fn new(
        config: &TrustConfig,
        channel: Arc<SecureChannel>,
        identity: HardwareIdentity,
        attestor: IntegrityAttestor,
    ) -> Self {
        Self {
            channel,
            identity,
            attestor,
            interval: config.heartbeat_interval,
            report_every: config.report_every.max(1),
            last_sent: Mutex::new(None),
            scan_mode: AtomicBool::new(false),
        }
    }

    /// Whether the server asked for a report on every cycle.
    pub fn scan_mode(&self) -> bool {
        self.scan_mode.load(Ordering::Relaxed)
    }

    /// The posture the server last accepted.
    pub async fn last_reported(&self) -> Option<ParsedPosture> {
        self.last_sent.lock().await.clone()
    }

    /// `POST /ping`.
    #[instrument(skip_all)]
    pub async fn ping(&self, token: &str) -> Result<(), TrustError> {
        let ack: Ack = self
            .channel
            .post_json(PING_PATH, &serde_json::json!({}), Some(token))
            .await?;
        if !ack.success {
            return Err(TrustError::InvalidResponse {
                endpoint: PING_PATH.into(),
                message: ack.message.unwrap_or_else(|| "Ping rejected".into()),
            });
        }
        Ok(())
    }

    /// Collect a fresh attestation and send it if the posture moved.
    ///
    /// The first report, a forced report and any report in scan mode are
    /// sent regardless of change.
    #[instrument(skip(self, token))]
    pub async fn report(&self, token: &str, force: bool) -> Result<ReportOutcome, TrustError> {
        let mut last_sent = self.last_sent.lock().await;

        let attestation = self.attestor.create_attestation().await;
        let changes = last_sent
            .as_ref()
            .map(|previous| posture_changes(previous, &attestation.parsed))
            .unwrap_or_default();
        if last_sent.is_some() && changes.is_empty() && !force && !self.scan_mode() {
            debug!("Posture unchanged; report skipped");
            return Ok(ReportOutcome::Unchanged);
        }

        let fingerprint = self.identity.hardware_id().await;
        let security = attestation.parsed.clone();
        let request = HeartbeatRequest {
            hardware_id: fingerprint.hash,
            security: security.clone(),
            system_info: (!changes.is_empty()).then(|| HeartbeatSystemInfo {
                security_changes: changes.clone(),
            }),
            verification: Some(attestation),
        };
        let reply: HeartbeatReply = self
            .channel
            .post_json(HEARTBEAT_PATH, &request, Some(token))
            .await?;
        if !reply.success {
            return Err(TrustError::InvalidResponse {
                endpoint: HEARTBEAT_PATH.into(),
                message: reply.message.unwrap_or_else(|| "Heartbeat rejected".into()),
            });
        }

        if let Some(enabled) = reply.data.and_then(|d| d.scan_mode_enabled) {
            if self.scan_mode.swap(enabled, Ordering::Relaxed) != enabled {
                info!(enabled, "Scan mode changed");
            }
        }
        *last_sent = Some(security);

        if changes.is_empty() {
            debug!("Posture reported");
        } else {
            info!(changes = ?changes, "Posture change reported");
        }
        Ok(ReportOutcome::Sent { changes })
    }

    /// Drive pings and reports until the session ends or `shutdown` fires.
    ///
    /// Send failures are logged and retried on the next cycle.
    #[instrument(skip_all)]
    pub async fn run(&self, sessions: &SessionManager, mut shutdown: watch::Receiver<bool>) {
        let Some(token) = session_token(sessions).await else {
            info!("No session; heartbeat not started");
            return;
        };
        if let Err(e) = self.report(&token, true).await {
            warn!(error = %e, "Initial posture report failed");
        }

        let mut cycle: u32 = 0;
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {},
                _ = shutdown.changed() => {
                    info!("Heartbeat stopped");
                    return;
                },
            }

            let Some(token) = session_token(sessions).await else {
                info!("Session ended; heartbeat stopped");
                return;
            };
            cycle = cycle.wrapping_add(1);

            if let Err(e) = self.ping(&token).await {
                warn!(error = %e, "Heartbeat ping failed");
            }
            if cycle % self.report_every == 0 || self.scan_mode() {
                if let Err(e) = self.report(&token, false).await {
                    warn!(error = %e, "Posture report failed");
                }
            }
        }
    }
}

async fn session_token(sessions: &SessionManager) -> Option<String> {
    match sessions.current().await {
        Ok(session) => session.map(|s| s.token),
        Err(e) => {
            warn!(error = %e, "Session unreadable");
            None
        },
    }
}
