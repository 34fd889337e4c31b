//! Hardware identity derivation.
//!
//! Preference order:
//!
//! 1. TPM 2.0 endorsement-key public-key hash
//! 2. Composite fingerprint:
//!
//! ```text
//! CPU:<manufacturer>:<brand>:<cores>|UUID:<uuid>|MB:<mfr>:<model>:<serial>|
//! BIOS:<vendor>:<serial>|DISK:<serial>|MID:<machine id>
//! ```
//!
//! hashed with SHA-256 and encoded as uppercase hex. Components whose probe
//! fails, times out, or returns nothing are left out, so the fingerprint
//! degrades to a hash over the subset that succeeded. Vendor placeholder
//! identifiers ("To be filled by O.E.M.", all zeros, ...) count as nothing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::HardwareError;
use crate::platform::SystemProbe;
use crate::probe::HardwareProbe;
use crate::types::{FingerprintKind, HardwareFingerprint, SystemInfo};

const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Serial and UUID values firmware vendors ship unfilled, lowercase.
const PLACEHOLDER_IDS: &[&str] = &[
    "to be filled by o.e.m.",
    "to be filled",
    "default string",
    "system serial number",
    "base board serial number",
    "chassis serial number",
    "not specified",
    "not applicable",
    "not available",
    "none",
    "n/a",
    "na",
    "oem",
    "o.e.m.",
    "unknown",
    "invalid",
    "123456789",
    "0123456789",
];

/// Timeout tiers for hardware queries.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Bound for fast local probes such as TPM presence.
    pub local_probe_timeout: Duration,
    /// Bound for each structured OS query (EK hash, CIM classes).
    pub structured_query_timeout: Duration,
    /// Try the TPM endorsement key before the composite fingerprint.
    pub prefer_tpm: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            local_probe_timeout: Duration::from_secs(5),
            structured_query_timeout: Duration::from_secs(15),
            prefer_tpm: true,
        }
    }
}

/// Derives the machine fingerprint from a [`HardwareProbe`].
#[derive(Clone)]
pub struct HardwareIdentity {
    probe: Arc<dyn HardwareProbe>,
    config: IdentityConfig,
}

impl std::fmt::Debug for HardwareIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareIdentity")
            .field("probe", &self.probe.name())
            .field("config", &self.config)
            .finish()
    }
}

impl HardwareIdentity {
    /// Create an identity source over `probe`.
    pub fn new(probe: Arc<dyn HardwareProbe>, config: IdentityConfig) -> Self {
        Self { probe, config }
    }

    /// Identity source backed by the current operating system.
    pub fn system(config: IdentityConfig) -> Self {
        let probe = SystemProbe::new(config.structured_query_timeout);
        Self::new(Arc::new(probe), config)
    }

    /// Configuration in use.
    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Derive the hardware fingerprint.
    ///
    /// Never fails: any probe error removes that source and the next one is
    /// tried. The result is recomputed on every call.
    pub async fn hardware_id(&self) -> HardwareFingerprint {
        if self.config.prefer_tpm {
            if let Some(fp) = self.tpm_fingerprint().await {
                info!(kind = "tpm2", "Hardware ID: using TPM endorsement key");
                return fp;
            }
        }
        let fp = self.composite_fingerprint().await;
        info!(kind = "composite", "Hardware ID: using composite fingerprint");
        fp
    }

    /// Whether a TPM 2.0 is available.
    ///
    /// Fail-closed: errors and timeouts report `false`.
    pub async fn check_tpm_availability(&self) -> bool {
        match bounded("tpm_present", self.config.local_probe_timeout, self.probe.tpm_present()).await {
            Ok(present) => {
                debug!(present, "TPM availability checked");
                present
            },
            Err(e) => {
                warn!(error = %e, "TPM availability check failed; treating as absent");
                false
            },
        }
    }

    async fn tpm_fingerprint(&self) -> Option<HardwareFingerprint> {
        if !self.check_tpm_availability().await {
            return None;
        }

        let ek = bounded(
            "tpm_endorsement_key_hash",
            self.config.structured_query_timeout,
            self.probe.tpm_endorsement_key_hash(),
        )
        .await;

        match ek {
            Ok(Some(raw)) => normalize_ek_hash(&raw).map(|hash| HardwareFingerprint {
                kind: FingerprintKind::Tpm2,
                hash,
            }),
            Ok(None) => {
                debug!("TPM present but endorsement key unreadable");
                None
            },
            Err(e) => {
                warn!(error = %e, "TPM endorsement key query failed; falling back");
                None
            },
        }
    }

    /// Composite fingerprint over every component that could be read.
    pub async fn composite_fingerprint(&self) -> HardwareFingerprint {
        let components = self.collect_components().await;
        debug!(components = components.len(), "Composite fingerprint components collected");
        HardwareFingerprint {
            kind: FingerprintKind::Composite,
            hash: composite_hash(&components),
        }
    }

    /// Component strings in fixed order, skipping failures.
    pub async fn collect_components(&self) -> Vec<String> {
        let t = self.config.structured_query_timeout;
        let p = &self.probe;

        let (cpu, system, board, bios, disk, mid) = tokio::join!(
            bounded("cpu", t, p.cpu()),
            bounded("system", t, p.system()),
            bounded("baseboard", t, p.baseboard()),
            bounded("bios", t, p.bios()),
            bounded("first_disk_serial", t, p.first_disk_serial()),
            bounded("machine_id", t, p.machine_id()),
        );

        let mut components = Vec::with_capacity(6);

        match cpu {
            Ok(cpu) if !(cpu.manufacturer.is_empty() && cpu.brand.is_empty()) => {
                components.push(format!("CPU:{}:{}:{}", cpu.manufacturer, cpu.brand, cpu.cores));
            },
            Ok(_) => debug!(component = "cpu", "Component empty; skipped"),
            Err(e) => skipped("cpu", &e),
        }
        match system {
            Ok(s) if !is_placeholder_id(&s.uuid) => components.push(format!("UUID:{}", s.uuid)),
            Ok(_) => debug!(component = "uuid", "Component empty; skipped"),
            Err(e) => skipped("uuid", &e),
        }
        match board {
            Ok(b) if !is_placeholder_id(&b.serial) => {
                components.push(format!("MB:{}:{}:{}", b.manufacturer, b.model, b.serial));
            },
            Ok(_) => debug!(component = "baseboard", "Component empty; skipped"),
            Err(e) => skipped("baseboard", &e),
        }
        match bios {
            Ok(b) if !is_placeholder_id(&b.serial) => components.push(format!("BIOS:{}:{}", b.vendor, b.serial)),
            Ok(_) => debug!(component = "bios", "Component empty; skipped"),
            Err(e) => skipped("bios", &e),
        }
        match disk {
            Ok(Some(serial)) if !is_placeholder_id(&serial) => components.push(format!("DISK:{serial}")),
            Ok(_) => debug!(component = "disk", "Component empty; skipped"),
            Err(e) => skipped("disk", &e),
        }
        match mid {
            Ok(id) if !id.is_empty() => components.push(format!("MID:{id}")),
            Ok(_) => debug!(component = "machine_id", "Component empty; skipped"),
            Err(e) => skipped("machine_id", &e),
        }

        components
    }

    /// Best-effort system snapshot for hardware registration.
    pub async fn system_info(&self) -> SystemInfo {
        let t = self.config.structured_query_timeout;
        let p = &self.probe;

        let (cpu, system, os, memory, board) = tokio::join!(
            bounded("cpu", t, p.cpu()),
            bounded("system", t, p.system()),
            bounded("os", t, p.os()),
            bounded("total_memory_bytes", t, p.total_memory_bytes()),
            bounded("baseboard", t, p.baseboard()),
        );

        SystemInfo {
            cpu: cpu.ok(),
            system: system.ok(),
            os: os.ok(),
            memory_gb: memory.ok().map(|b| (b + BYTES_PER_GIB / 2) / BYTES_PER_GIB),
            baseboard: board.ok(),
        }
    }
}

fn skipped(component: &str, error: &HardwareError) {
    debug!(component, error = %error, "Component probe failed; skipped");
}

/// Run a probe future under its own timeout.
async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, HardwareError>
where
    F: Future<Output = Result<T, HardwareError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(HardwareError::Timeout {
            operation: operation.to_string(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Whether a firmware identifier carries no machine-specific information.
///
/// Empty values, known vendor placeholders, and values whose digits are all
/// the same filler (`0000...`, `FFFFFFFF-FFFF-...`) all qualify.
pub fn is_placeholder_id(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    if PLACEHOLDER_IDS.contains(&lower.as_str()) {
        return true;
    }
    let mut significant = lower.chars().filter(char::is_ascii_alphanumeric);
    match significant.next() {
        None => true,
        Some(first) => (first == '0' || first == 'f') && significant.all(|c| c == first),
    }
}

/// SHA-256 over `|`-joined components, uppercase hex.
pub fn composite_hash(components: &[String]) -> String {
    let joined = components.join("|");
    hex::encode_upper(Sha256::digest(joined.as_bytes()))
}

/// Uppercase a hex EK hash; hash anything else so the result is still hex.
fn normalize_ek_hash(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(trimmed.to_ascii_uppercase())
    } else {
        Some(hex::encode_upper(Sha256::digest(trimmed.as_bytes())))
    }
}
