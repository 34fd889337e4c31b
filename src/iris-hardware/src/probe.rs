//! Platform probe trait.
//!
//! [`HardwareProbe`] is the seam between fingerprint derivation and the
//! operating system. Each method answers one question and may fail or hang
//! independently; [`HardwareIdentity`](crate::HardwareIdentity) bounds every
//! call with its own timeout and treats failures as missing components.

use async_trait::async_trait;

use crate::error::HardwareError;
use crate::types::{BiosDescriptor, BoardDescriptor, CpuDescriptor, OsDescriptor, SystemDescriptor};

/// Source of raw hardware facts.
///
/// ## Platform Implementations
///
/// - Linux: sysfs DMI attributes, `/proc`, TPM device nodes
/// - Windows: PowerShell CIM queries and the registry
/// - Tests: in-memory fakes that fail or hang on demand
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Whether a TPM 2.0 device is present and enabled.
    async fn tpm_present(&self) -> Result<bool, HardwareError>;

    /// Hex hash of the TPM endorsement-key public key, if one can be read.
    async fn tpm_endorsement_key_hash(&self) -> Result<Option<String>, HardwareError>;

    /// CPU descriptor.
    async fn cpu(&self) -> Result<CpuDescriptor, HardwareError>;

    /// System product descriptor including the SMBIOS UUID.
    async fn system(&self) -> Result<SystemDescriptor, HardwareError>;

    /// Baseboard descriptor.
    async fn baseboard(&self) -> Result<BoardDescriptor, HardwareError>;

    /// Firmware descriptor.
    async fn bios(&self) -> Result<BiosDescriptor, HardwareError>;

    /// Serial number of the first physical disk.
    async fn first_disk_serial(&self) -> Result<Option<String>, HardwareError>;

    /// Machine-scoped install identifier (`/etc/machine-id`, `MachineGuid`).
    async fn machine_id(&self) -> Result<String, HardwareError>;

    /// Operating system descriptor.
    async fn os(&self) -> Result<OsDescriptor, HardwareError>;

    /// Installed physical memory in bytes.
    async fn total_memory_bytes(&self) -> Result<u64, HardwareError>;
}
