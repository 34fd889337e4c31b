//! Pure parsers for raw security-posture output.
//!
//! Each parser takes the trimmed text captured for one signal and returns a
//! typed value or a [`ParseFailure`]. None of them execute anything, so the
//! server can re-run the same parsing over the raw text it receives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::posture::PostureSignal;

/// Raw text that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse {signal} output: {reason}")]
pub struct ParseFailure {
    /// Signal whose output was rejected.
    pub signal: &'static str,
    /// What was wrong with it.
    pub reason: String,
}

impl ParseFailure {
    fn new(signal: PostureSignal, reason: impl Into<String>) -> Self {
        Self {
            signal: signal.as_str(),
            reason: reason.into(),
        }
    }
}

/// TPM state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmStatus {
    /// A TPM is present.
    pub present: bool,
    /// The TPM is enabled and ready.
    pub enabled: bool,
    /// Specification version, when reported.
    pub version: Option<String>,
}

/// Virtualization-based security state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGuardStatus {
    /// VBS configured or running.
    pub vbs: bool,
    /// Hypervisor-enforced code integrity running.
    pub hvci: bool,
    /// DMA protection (IOMMU) available.
    pub iommu: bool,
}

/// Microsoft Defender state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefenderStatus {
    /// Antivirus engine enabled.
    pub antivirus: bool,
    /// Real-time protection enabled.
    pub realtime: bool,
    /// Tamper protection enabled.
    pub tamper_protected: bool,
}

/// Structured posture derived from the raw outputs.
///
/// Field order is part of the attestation hash input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPosture {
    /// TPM state.
    pub tpm: TpmStatus,
    /// UEFI Secure Boot enabled.
    pub secure_boot: bool,
    /// Hardware virtualization enabled or a hypervisor running.
    pub virtualization: bool,
    /// DMA protection available.
    pub iommu: bool,
    /// HVCI running.
    pub hvci: bool,
    /// VBS running.
    pub vbs: bool,
    /// Defender antivirus enabled.
    pub defender: bool,
    /// Defender real-time protection enabled.
    pub defender_realtime: bool,
    /// System drive encrypted and protection on.
    pub disk_encryption: bool,
}

impl ParsedPosture {
    /// Combine per-signal parses with fixed precedence.
    ///
    /// - TPM: the `Get-Tpm` cmdlet output wins over the WMI class.
    /// - IOMMU: DeviceGuard's reported property wins over the DMA registry policy.
    /// - Virtualization: firmware flag OR hypervisor present.
    ///
    /// Signals that failed or did not parse count as absent.
    #[must_use]
    pub fn from_raw(raw: &BTreeMap<PostureSignal, String>) -> Self {
        let get = |signal: PostureSignal| raw.get(&signal).map(String::as_str).filter(|s| !is_error(s));

        let tpm = get(PostureSignal::Tpm)
            .and_then(|r| parse_tpm(r).ok())
            .or_else(|| get(PostureSignal::TpmWmi).and_then(|r| parse_tpm_wmi(r).ok()))
            .unwrap_or_default();

        let device_guard = get(PostureSignal::DeviceGuard)
            .and_then(|r| parse_device_guard(r).ok())
            .unwrap_or_default();

        let firmware_virtualization = get(PostureSignal::Virtualization)
            .and_then(|r| parse_flag(PostureSignal::Virtualization, r).ok())
            .unwrap_or(false);
        let hypervisor = get(PostureSignal::Hypervisor)
            .and_then(|r| parse_flag(PostureSignal::Hypervisor, r).ok())
            .unwrap_or(false);

        let iommu = device_guard.iommu
            || get(PostureSignal::Iommu)
                .and_then(|r| parse_dma_policy(r).ok())
                .unwrap_or(false);

        let defender = get(PostureSignal::Defender)
            .and_then(|r| parse_defender(r).ok())
            .unwrap_or_default();

        Self {
            tpm,
            secure_boot: get(PostureSignal::SecureBoot)
                .and_then(|r| parse_secure_boot(r).ok())
                .unwrap_or(false),
            virtualization: firmware_virtualization || hypervisor,
            iommu,
            hvci: device_guard.hvci,
            vbs: device_guard.vbs,
            defender: defender.antivirus,
            defender_realtime: defender.realtime,
            disk_encryption: get(PostureSignal::DiskEncryption)
                .and_then(|r| parse_disk_encryption(r).ok())
                .unwrap_or(false),
        }
    }
}

/// Captured output of a probe that failed.
#[must_use]
pub fn is_error(raw: &str) -> bool {
    raw.starts_with("ERROR")
}

fn json(signal: PostureSignal, raw: &str) -> Result<Value, ParseFailure> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ParseFailure::new(signal, e.to_string()))?;
    // ConvertTo-Json emits an array when a class has several instances.
    Ok(match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    })
}

fn is_true(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Values of a CIM property that may be a scalar or an array of integers.
fn integers(value: &Value, key: &str) -> Vec<i64> {
    match value.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
        Some(v) => v.as_i64().into_iter().collect(),
        None => Vec::new(),
    }
}

/// Read a `REG_DWORD` value out of `reg query` output.
fn reg_dword(raw: &str, name: &str) -> Option<u32> {
    raw.lines()
        .find(|line| line.split_whitespace().next() == Some(name))
        .and_then(|line| line.split_whitespace().last())
        .and_then(|v| {
            let digits = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")).unwrap_or(v);
            u32::from_str_radix(digits, 16).ok()
        })
}

/// `Get-Tpm` projection: `{Present, Ready, Enabled}`.
pub fn parse_tpm(raw: &str) -> Result<TpmStatus, ParseFailure> {
    let value = json(PostureSignal::Tpm, raw)?;
    if value.get("Present").is_none() {
        return Err(ParseFailure::new(PostureSignal::Tpm, "Present field missing"));
    }
    Ok(TpmStatus {
        present: is_true(&value, "Present"),
        enabled: is_true(&value, "Ready") || is_true(&value, "Enabled"),
        version: None,
    })
}

/// `Win32_Tpm` projection: `{IsEnabled_InitialValue, IsActivated_InitialValue, SpecVersion}`.
pub fn parse_tpm_wmi(raw: &str) -> Result<TpmStatus, ParseFailure> {
    let value = json(PostureSignal::TpmWmi, raw)?;
    if !value.is_object() {
        return Err(ParseFailure::new(PostureSignal::TpmWmi, "expected an object"));
    }
    let version = value
        .get("SpecVersion")
        .and_then(Value::as_str)
        .and_then(|spec| spec.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    Ok(TpmStatus {
        present: true,
        enabled: is_true(&value, "IsEnabled_InitialValue"),
        version,
    })
}

/// `UEFISecureBootEnabled` registry value.
pub fn parse_secure_boot(raw: &str) -> Result<bool, ParseFailure> {
    reg_dword(raw, "UEFISecureBootEnabled")
        .map(|v| v == 1)
        .ok_or_else(|| ParseFailure::new(PostureSignal::SecureBoot, "UEFISecureBootEnabled not found"))
}

/// `Win32_DeviceGuard` projection.
///
/// `SecurityServicesRunning` containing 2 means HVCI; `AvailableSecurityProperties`
/// containing 3 means DMA protection.
pub fn parse_device_guard(raw: &str) -> Result<DeviceGuardStatus, ParseFailure> {
    let value = json(PostureSignal::DeviceGuard, raw)?;
    let vbs_status = value
        .get("VirtualizationBasedSecurityStatus")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            ParseFailure::new(PostureSignal::DeviceGuard, "VirtualizationBasedSecurityStatus missing")
        })?;
    Ok(DeviceGuardStatus {
        vbs: vbs_status >= 1,
        hvci: integers(&value, "SecurityServicesRunning").contains(&2),
        iommu: integers(&value, "AvailableSecurityProperties").contains(&3),
    })
}

/// A bare PowerShell boolean (`True` / `False`).
pub fn parse_flag(signal: PostureSignal, raw: &str) -> Result<bool, ParseFailure> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ParseFailure::new(signal, format!("expected True/False, got '{other}'"))),
    }
}

/// `MSFT_MpComputerStatus` projection.
pub fn parse_defender(raw: &str) -> Result<DefenderStatus, ParseFailure> {
    let value = json(PostureSignal::Defender, raw)?;
    if value.get("AntivirusEnabled").is_none() {
        return Err(ParseFailure::new(PostureSignal::Defender, "AntivirusEnabled field missing"));
    }
    Ok(DefenderStatus {
        antivirus: is_true(&value, "AntivirusEnabled"),
        realtime: is_true(&value, "RealTimeProtectionEnabled"),
        tamper_protected: is_true(&value, "IsTamperProtected"),
    })
}

/// `DmaRemappingPolicy` registry value; 1 or 2 means remapping is enforced.
pub fn parse_dma_policy(raw: &str) -> Result<bool, ParseFailure> {
    reg_dword(raw, "DmaRemappingPolicy")
        .map(|v| v == 1 || v == 2)
        .ok_or_else(|| ParseFailure::new(PostureSignal::Iommu, "DmaRemappingPolicy not found"))
}

/// `Win32_EncryptableVolume` projection; `ProtectionStatus` 1 means protected.
pub fn parse_disk_encryption(raw: &str) -> Result<bool, ParseFailure> {
    let value = json(PostureSignal::DiskEncryption, raw)?;
    value
        .get("ProtectionStatus")
        .and_then(Value::as_i64)
        .map(|status| status == 1)
        .ok_or_else(|| ParseFailure::new(PostureSignal::DiskEncryption, "ProtectionStatus missing"))
}
