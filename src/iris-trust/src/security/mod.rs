//! Client integrity attestation.
//!
//! This module assembles the evidence the server uses to judge a client:
//!
//! - Code integrity hashes over a fixed allow-list of files
//! - Anti-debugging heuristics
//! - Raw and parsed OS security posture
//! - Process metadata
//!
//! ## Usage
//!
//! ```rust,ignore
//! use iris_trust::security::IntegrityAttestor;
//!
//! let attestor = IntegrityAttestor::system(&config);
//! let attestation = attestor.create_attestation().await;
//! send(&attestation.attestation_hash);
//! ```

pub mod anti_tamper;
pub mod file_integrity;
pub mod parsers;
pub mod posture;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::TrustConfig;

pub use anti_tamper::{detect_debugging, DebugChecks};
pub use file_integrity::{code_integrity_hash, CodeIntegrity};
pub use parsers::{ParseFailure, ParsedPosture};
pub use posture::{collect_posture, PostureReport, PostureSignal, ProbeRunner, ShellProbeRunner};

/// Process metadata attached to an attestation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Process id.
    pub pid: u32,
    /// Seconds since the trust layer was first initialised in this process.
    pub uptime: f64,
    /// Resident memory in bytes, where the platform reports it.
    pub memory_usage: Option<u64>,
    /// Path of the running executable.
    pub exec_path: String,
}

/// Tamper-evident bundle of client evidence. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAttestation {
    /// Capture time, epoch milliseconds.
    pub timestamp: i64,
    /// Raw probe output per signal.
    pub raw_outputs: BTreeMap<PostureSignal, String>,
    /// Truncated digest per signal.
    pub hashes: BTreeMap<PostureSignal, String>,
    /// Structured posture.
    pub parsed: ParsedPosture,
    /// Debugging heuristics.
    pub debug_checks: DebugChecks,
    /// Code integrity hashes.
    pub integrity: CodeIntegrity,
    /// Binds every raw output to the timestamp.
    pub verification_token: String,
    /// Process metadata.
    pub process: ProcessInfo,
    /// SHA-256 over `{timestamp, parsed, hashes, integrity, pid}`.
    pub attestation_hash: String,
}

/// The fields committed by `attestation_hash`, in serialization order.
#[derive(Serialize)]
struct AttestationCommitment<'a> {
    timestamp: i64,
    parsed: &'a ParsedPosture,
    hashes: &'a BTreeMap<PostureSignal, String>,
    integrity: &'a str,
    pid: u32,
}

/// Compute the attestation hash.
#[must_use]
pub fn attestation_hash(
    timestamp: i64,
    parsed: &ParsedPosture,
    hashes: &BTreeMap<PostureSignal, String>,
    combined_integrity: &str,
    pid: u32,
) -> String {
    let commitment = AttestationCommitment {
        timestamp,
        parsed,
        hashes,
        integrity: combined_integrity,
        pid,
    };
    // Plain structs and string-keyed maps always serialize.
    let json = serde_json::to_string(&commitment).unwrap_or_default();
    iris_crypto::sha256_hex(json.as_bytes())
}

/// Produces integrity evidence for this client.
#[derive(Clone)]
pub struct IntegrityAttestor {
    runner: Arc<dyn ProbeRunner>,
    install_root: PathBuf,
    critical_files: Vec<PathBuf>,
    local_probe_timeout: Duration,
    structured_query_timeout: Duration,
    debug_timing_threshold: Duration,
}

impl std::fmt::Debug for IntegrityAttestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityAttestor")
            .field("install_root", &self.install_root)
            .field("critical_files", &self.critical_files)
            .finish_non_exhaustive()
    }
}

impl IntegrityAttestor {
    /// Create an attestor with a custom probe runner.
    pub fn new(config: &TrustConfig, runner: Arc<dyn ProbeRunner>) -> Self {
        process_started();
        Self {
            runner,
            install_root: config.install_root.clone(),
            critical_files: config.critical_files.clone(),
            local_probe_timeout: config.timeouts.local_probe,
            structured_query_timeout: config.timeouts.structured_query,
            debug_timing_threshold: config.debug_timing_threshold,
        }
    }

    /// Create an attestor that runs the platform queries.
    pub fn system(config: &TrustConfig) -> Self {
        Self::new(config, Arc::new(ShellProbeRunner))
    }

    /// Hash the critical files.
    pub async fn code_integrity_hash(&self) -> CodeIntegrity {
        code_integrity_hash(&self.install_root, &self.critical_files).await
    }

    /// Run the debugging heuristics.
    pub async fn detect_debugging(&self) -> DebugChecks {
        detect_debugging(self.debug_timing_threshold, self.local_probe_timeout).await
    }

    /// Capture the posture batch.
    pub async fn security_posture(&self) -> PostureReport {
        collect_posture(Arc::clone(&self.runner), self.structured_query_timeout).await
    }

    /// Assemble a full attestation.
    #[instrument(skip(self))]
    pub async fn create_attestation(&self) -> SecurityAttestation {
        let timestamp = Utc::now().timestamp_millis();
        let (integrity, posture, debug_checks, process) = tokio::join!(
            self.code_integrity_hash(),
            self.security_posture(),
            self.detect_debugging(),
            process_info(),
        );

        let verification_token = posture.verification_token(timestamp);
        let attestation_hash = attestation_hash(
            timestamp,
            &posture.parsed,
            &posture.hashes,
            &integrity.combined,
            process.pid,
        );
        debug!(
            attestation_hash = %attestation_hash,
            debug_flags = debug_checks.any(),
            "Attestation assembled"
        );

        SecurityAttestation {
            timestamp,
            raw_outputs: posture.raw_outputs,
            hashes: posture.hashes,
            parsed: posture.parsed,
            debug_checks,
            integrity,
            verification_token,
            process,
            attestation_hash,
        }
    }
}

fn process_started() -> Instant {
    static STARTED: OnceLock<Instant> = OnceLock::new();
    *STARTED.get_or_init(Instant::now)
}

async fn process_info() -> ProcessInfo {
    ProcessInfo {
        pid: std::process::id(),
        uptime: process_started().elapsed().as_secs_f64(),
        memory_usage: resident_memory().await,
        exec_path: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(target_os = "linux")]
async fn resident_memory() -> Option<u64> {
    let status = tokio::fs::read_to_string("/proc/self/status").await.ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
async fn resident_memory() -> Option<u64> {
    None
}

/// `VmRSS` in bytes from `/proc/<pid>/status`.
#[cfg_attr(not(any(target_os = "linux", test)), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let kib: u64 = status
        .lines()
        .find_map(|l| l.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}
