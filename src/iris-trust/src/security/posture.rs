//! OS security-posture capture.
//!
//! A fixed batch of probes runs concurrently, each under its own timeout.
//! For every signal the raw trimmed output is kept verbatim so the server
//! can re-parse it, alongside a short digest and the local parse.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use iris_hardware::HardwareError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::parsers::ParsedPosture;

/// Hash recorded for a probe that failed.
pub const ERROR_HASH: &str = "error";

/// Hex characters kept from each raw-output digest.
const RAW_HASH_LEN: usize = 16;

/// One posture signal.
///
/// Declaration order is the canonical order used for maps, the
/// verification token and the attestation hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostureSignal {
    /// `Get-Tpm` cmdlet.
    Tpm,
    /// `Win32_Tpm` WMI class.
    TpmWmi,
    /// Secure Boot registry state.
    SecureBoot,
    /// `Win32_DeviceGuard` (VBS, HVCI, DMA protection).
    DeviceGuard,
    /// Firmware virtualization flag.
    Virtualization,
    /// Hypervisor present flag.
    Hypervisor,
    /// Defender status.
    Defender,
    /// DMA remapping registry policy.
    Iommu,
    /// BitLocker protection of the system drive.
    DiskEncryption,
}

impl PostureSignal {
    /// Every signal, in canonical order.
    pub const ALL: [Self; 9] = [
        Self::Tpm,
        Self::TpmWmi,
        Self::SecureBoot,
        Self::DeviceGuard,
        Self::Virtualization,
        Self::Hypervisor,
        Self::Defender,
        Self::Iommu,
        Self::DiskEncryption,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tpm => "tpm",
            Self::TpmWmi => "tpmWmi",
            Self::SecureBoot => "secureBoot",
            Self::DeviceGuard => "deviceGuard",
            Self::Virtualization => "virtualization",
            Self::Hypervisor => "hypervisor",
            Self::Defender => "defender",
            Self::Iommu => "iommu",
            Self::DiskEncryption => "diskEncryption",
        }
    }
}

impl std::fmt::Display for PostureSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes the query behind a posture signal.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Run the query for `signal` and return its trimmed output.
    async fn run(&self, signal: PostureSignal, timeout: Duration) -> Result<String, HardwareError>;
}

/// Runs the Windows PowerShell and registry queries.
///
/// On other platforms every signal reports `NotSupported`, which degrades
/// to an absent/false posture.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellProbeRunner;

#[cfg(target_os = "windows")]
mod windows_queries {
    use super::PostureSignal;

    pub(super) enum Query {
        PowerShell(&'static str),
        Registry { key: &'static str, value: &'static str },
    }

    pub(super) fn query(signal: PostureSignal) -> Query {
        match signal {
            PostureSignal::Tpm => Query::PowerShell(
                "$tpm = Get-Tpm -ErrorAction Stop; [PSCustomObject]@{Present=$tpm.TpmPresent; Ready=$tpm.TpmReady; Enabled=$tpm.TpmEnabled} | ConvertTo-Json -Compress",
            ),
            PostureSignal::TpmWmi => Query::PowerShell(
                "Get-CimInstance -Namespace root/cimv2/Security/MicrosoftTpm -ClassName Win32_Tpm -ErrorAction Stop | Select-Object IsEnabled_InitialValue, IsActivated_InitialValue, SpecVersion | ConvertTo-Json -Compress",
            ),
            PostureSignal::SecureBoot => Query::Registry {
                key: r"HKLM\SYSTEM\CurrentControlSet\Control\SecureBoot\State",
                value: "UEFISecureBootEnabled",
            },
            PostureSignal::DeviceGuard => Query::PowerShell(
                "Get-CimInstance -ClassName Win32_DeviceGuard -Namespace root/Microsoft/Windows/DeviceGuard -ErrorAction Stop | Select-Object VirtualizationBasedSecurityStatus, SecurityServicesRunning, AvailableSecurityProperties | ConvertTo-Json -Compress",
            ),
            PostureSignal::Virtualization => {
                Query::PowerShell("(Get-CimInstance -ClassName Win32_Processor).VirtualizationFirmwareEnabled")
            },
            PostureSignal::Hypervisor => {
                Query::PowerShell("(Get-CimInstance -ClassName Win32_ComputerSystem).HypervisorPresent")
            },
            PostureSignal::Defender => Query::PowerShell(
                "Get-CimInstance -Namespace root/Microsoft/Windows/Defender -ClassName MSFT_MpComputerStatus -ErrorAction Stop | Select-Object AntivirusEnabled, RealTimeProtectionEnabled, IsTamperProtected | ConvertTo-Json -Compress",
            ),
            PostureSignal::Iommu => Query::Registry {
                key: r"HKLM\SYSTEM\CurrentControlSet\Control\DmaSecurity",
                value: "DmaRemappingPolicy",
            },
            PostureSignal::DiskEncryption => Query::PowerShell(
                "Get-CimInstance -Namespace root/cimv2/Security/MicrosoftVolumeEncryption -ClassName Win32_EncryptableVolume -Filter \"DriveLetter='$env:SystemDrive'\" -ErrorAction Stop | Select-Object DriveLetter, ProtectionStatus | ConvertTo-Json -Compress",
            ),
        }
    }
}

#[async_trait]
impl ProbeRunner for ShellProbeRunner {
    #[cfg(target_os = "windows")]
    async fn run(&self, signal: PostureSignal, timeout: Duration) -> Result<String, HardwareError> {
        use iris_hardware::platform::{powershell, run_command};
        use windows_queries::{query, Query};

        match query(signal) {
            Query::PowerShell(script) => powershell(script, timeout).await,
            Query::Registry { key, value } => run_command("reg", &["query", key, "/v", value], timeout).await,
        }
    }

    #[cfg(not(target_os = "windows"))]
    async fn run(&self, signal: PostureSignal, _timeout: Duration) -> Result<String, HardwareError> {
        Err(HardwareError::not_supported(signal.as_str()))
    }
}

/// Raw outputs, digests and parse for the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureReport {
    /// Trimmed output per signal, or `ERROR: <reason>`.
    pub raw_outputs: BTreeMap<PostureSignal, String>,
    /// First 16 hex characters of SHA-256 over the raw output, or `error`.
    pub hashes: BTreeMap<PostureSignal, String>,
    /// Best-effort structured posture.
    pub parsed: ParsedPosture,
}

impl PostureReport {
    /// `hex(SHA-256(raw outputs joined by '|' in signal order, then timestamp))`.
    #[must_use]
    pub fn verification_token(&self, timestamp_ms: i64) -> String {
        verification_token(&self.raw_outputs, timestamp_ms)
    }
}

/// Truncated digest of one raw output.
#[must_use]
pub fn raw_output_hash(raw: &str) -> String {
    let mut digest = hex::encode(Sha256::digest(raw.as_bytes()));
    digest.truncate(RAW_HASH_LEN);
    digest
}

/// Token binding every raw output to the attestation timestamp.
#[must_use]
pub fn verification_token(raw_outputs: &BTreeMap<PostureSignal, String>, timestamp_ms: i64) -> String {
    let joined = raw_outputs.values().map(String::as_str).collect::<Vec<_>>().join("|");
    iris_crypto::sha256_hex(format!("{joined}{timestamp_ms}").as_bytes())
}

/// Run every signal concurrently, each bounded by `timeout`.
pub async fn collect_posture(runner: Arc<dyn ProbeRunner>, timeout: Duration) -> PostureReport {
    let probes = PostureSignal::ALL.iter().map(|&signal| {
        let runner = Arc::clone(&runner);
        async move {
            let outcome = match tokio::time::timeout(timeout, runner.run(signal, timeout)).await {
                Ok(Ok(output)) => Ok(output.trim().to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };
            (signal, outcome)
        }
    });

    let mut raw_outputs = BTreeMap::new();
    let mut hashes = BTreeMap::new();
    for (signal, outcome) in join_all(probes).await {
        match outcome {
            Ok(raw) => {
                debug!(signal = %signal, bytes = raw.len(), "Posture probe captured");
                hashes.insert(signal, raw_output_hash(&raw));
                raw_outputs.insert(signal, raw);
            },
            Err(reason) => {
                warn!(signal = %signal, reason = %reason, "Posture probe failed");
                hashes.insert(signal, ERROR_HASH.to_string());
                raw_outputs.insert(signal, format!("ERROR: {reason}"));
            },
        }
    }

    let parsed = ParsedPosture::from_raw(&raw_outputs);
    PostureReport {
        raw_outputs,
        hashes,
        parsed,
    }
}
