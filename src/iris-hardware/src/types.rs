//! Hardware descriptor and fingerprint types.

use serde::{Deserialize, Serialize};

/// How a [`HardwareFingerprint`] was anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FingerprintKind {
    /// TPM 2.0 endorsement-key public-key hash.
    #[serde(rename = "tpm2")]
    Tpm2,
    /// SHA-256 over a fixed-order list of hardware component strings.
    #[serde(rename = "composite")]
    Composite,
}

impl FingerprintKind {
    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tpm2 => "tpm2",
            Self::Composite => "composite",
        }
    }
}

/// Stable per-machine identifier.
///
/// Recomputed on every request and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareFingerprint {
    /// Anchor used to derive the hash.
    pub kind: FingerprintKind,
    /// Uppercase hex hash.
    pub hash: String,
}

/// CPU identity as reported by the OS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuDescriptor {
    /// Vendor string, e.g. `GenuineIntel` or `Intel`.
    pub manufacturer: String,
    /// Marketing name.
    pub brand: String,
    /// Logical core count.
    pub cores: u32,
}

/// System product identity (SMBIOS type 1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemDescriptor {
    /// System manufacturer.
    pub manufacturer: String,
    /// System model.
    pub model: String,
    /// SMBIOS system UUID.
    pub uuid: String,
}

/// Baseboard identity (SMBIOS type 2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardDescriptor {
    /// Board manufacturer.
    pub manufacturer: String,
    /// Board model / product name.
    pub model: String,
    /// Board serial number.
    #[serde(skip_serializing, default)]
    pub serial: String,
}

/// Firmware identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiosDescriptor {
    /// Firmware vendor.
    pub vendor: String,
    /// Serial number exposed by the firmware.
    pub serial: String,
}

/// Operating system description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsDescriptor {
    /// Platform family (`windows`, `linux`, ...).
    pub platform: String,
    /// Distribution or product name.
    pub distro: String,
    /// Kernel or build version.
    pub release: String,
    /// CPU architecture.
    pub arch: String,
}

/// Snapshot sent once at hardware registration for server-side
/// plausibility checks. Every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// CPU descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuDescriptor>,
    /// System product descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemDescriptor>,
    /// OS descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsDescriptor>,
    /// Installed memory, rounded to whole GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<u64>,
    /// Baseboard descriptor (serial omitted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseboard: Option<BoardDescriptor>,
}
