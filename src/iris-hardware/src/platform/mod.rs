//! Platform-specific hardware probes.
//!
//! - Linux: sysfs DMI attributes, procfs, TPM device nodes
//! - Windows: PowerShell CIM queries, TPM cmdlets, registry
//! - Other targets: every query reports `NotSupported`

use std::time::Duration;

use async_trait::async_trait;

use crate::error::HardwareError;
use crate::probe::HardwareProbe;
use crate::types::{BiosDescriptor, BoardDescriptor, CpuDescriptor, OsDescriptor, SystemDescriptor};

pub mod command;
mod tpm;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(any(target_os = "windows", test))]
#[cfg_attr(not(target_os = "windows"), allow(dead_code, unused_imports))]
mod windows;

pub use command::{powershell, run_command};

/// Default bound for a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Production probe for the current operating system.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    command_timeout: Duration,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl SystemProbe {
    /// Create a probe whose external commands are killed after `command_timeout`.
    #[must_use]
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl HardwareProbe for SystemProbe {
    fn name(&self) -> &'static str {
        "linux-sysfs"
    }

    async fn tpm_present(&self) -> Result<bool, HardwareError> {
        tpm::detect_tpm(self.command_timeout).await
    }

    async fn tpm_endorsement_key_hash(&self) -> Result<Option<String>, HardwareError> {
        tpm::endorsement_key_hash(self.command_timeout).await
    }

    async fn cpu(&self) -> Result<CpuDescriptor, HardwareError> {
        linux::cpu().await
    }

    async fn system(&self) -> Result<SystemDescriptor, HardwareError> {
        linux::system().await
    }

    async fn baseboard(&self) -> Result<BoardDescriptor, HardwareError> {
        linux::baseboard().await
    }

    async fn bios(&self) -> Result<BiosDescriptor, HardwareError> {
        linux::bios().await
    }

    async fn first_disk_serial(&self) -> Result<Option<String>, HardwareError> {
        linux::first_disk_serial().await
    }

    async fn machine_id(&self) -> Result<String, HardwareError> {
        linux::machine_id().await
    }

    async fn os(&self) -> Result<OsDescriptor, HardwareError> {
        linux::os().await
    }

    async fn total_memory_bytes(&self) -> Result<u64, HardwareError> {
        linux::total_memory_bytes().await
    }
}

#[cfg(target_os = "windows")]
#[async_trait]
impl HardwareProbe for SystemProbe {
    fn name(&self) -> &'static str {
        "windows-cim"
    }

    async fn tpm_present(&self) -> Result<bool, HardwareError> {
        tpm::detect_tpm(self.command_timeout).await
    }

    async fn tpm_endorsement_key_hash(&self) -> Result<Option<String>, HardwareError> {
        tpm::endorsement_key_hash(self.command_timeout).await
    }

    async fn cpu(&self) -> Result<CpuDescriptor, HardwareError> {
        windows::cpu(self.command_timeout).await
    }

    async fn system(&self) -> Result<SystemDescriptor, HardwareError> {
        windows::system(self.command_timeout).await
    }

    async fn baseboard(&self) -> Result<BoardDescriptor, HardwareError> {
        windows::baseboard(self.command_timeout).await
    }

    async fn bios(&self) -> Result<BiosDescriptor, HardwareError> {
        windows::bios(self.command_timeout).await
    }

    async fn first_disk_serial(&self) -> Result<Option<String>, HardwareError> {
        windows::first_disk_serial(self.command_timeout).await
    }

    async fn machine_id(&self) -> Result<String, HardwareError> {
        windows::machine_id(self.command_timeout).await
    }

    async fn os(&self) -> Result<OsDescriptor, HardwareError> {
        windows::os(self.command_timeout).await
    }

    async fn total_memory_bytes(&self) -> Result<u64, HardwareError> {
        windows::total_memory_bytes(self.command_timeout).await
    }
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
#[async_trait]
impl HardwareProbe for SystemProbe {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn tpm_present(&self) -> Result<bool, HardwareError> {
        tpm::detect_tpm(self.command_timeout).await
    }

    async fn tpm_endorsement_key_hash(&self) -> Result<Option<String>, HardwareError> {
        tpm::endorsement_key_hash(self.command_timeout).await
    }

    async fn cpu(&self) -> Result<CpuDescriptor, HardwareError> {
        Err(HardwareError::not_supported("cpu"))
    }

    async fn system(&self) -> Result<SystemDescriptor, HardwareError> {
        Err(HardwareError::not_supported("system"))
    }

    async fn baseboard(&self) -> Result<BoardDescriptor, HardwareError> {
        Err(HardwareError::not_supported("baseboard"))
    }

    async fn bios(&self) -> Result<BiosDescriptor, HardwareError> {
        Err(HardwareError::not_supported("bios"))
    }

    async fn first_disk_serial(&self) -> Result<Option<String>, HardwareError> {
        Err(HardwareError::not_supported("disk serial"))
    }

    async fn machine_id(&self) -> Result<String, HardwareError> {
        Err(HardwareError::not_supported("machine id"))
    }

    async fn os(&self) -> Result<OsDescriptor, HardwareError> {
        Ok(OsDescriptor {
            platform: std::env::consts::OS.to_string(),
            distro: String::new(),
            release: String::new(),
            arch: std::env::consts::ARCH.to_string(),
        })
    }

    async fn total_memory_bytes(&self) -> Result<u64, HardwareError> {
        Err(HardwareError::not_supported("memory"))
    }
}
