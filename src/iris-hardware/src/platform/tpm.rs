//! TPM 2.0 presence and endorsement-key queries.
//!
//! Linux reads the kernel device nodes and, when `tpm2-tools` is installed,
//! the name of the persistent endorsement key. Windows asks the TPM cmdlets.

use std::time::Duration;

use crate::error::HardwareError;

/// Persistent handle of the RSA endorsement key (TCG EK profile).
#[cfg(target_os = "linux")]
const EK_PERSISTENT_HANDLE: &str = "0x81010001";

/// Detect a TPM 2.0 device.
#[cfg(target_os = "linux")]
pub async fn detect_tpm(_timeout: Duration) -> Result<bool, HardwareError> {
    use std::path::Path;

    let has_tpm0 = Path::new("/dev/tpm0").exists();
    let has_tpmrm0 = Path::new("/dev/tpmrm0").exists();

    if !has_tpm0 && !has_tpmrm0 {
        tracing::debug!("TPM: no device nodes found (/dev/tpm0, /dev/tpmrm0)");
        return Ok(false);
    }

    let major = tokio::fs::read_to_string("/sys/class/tpm/tpm0/tpm_version_major")
        .await
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok());

    tracing::debug!(
        tpm0 = has_tpm0,
        tpmrm0 = has_tpmrm0,
        version_major = ?major,
        "TPM: device nodes detected"
    );

    // Older kernels do not expose the version; treat the node as TPM 2.0.
    Ok(major.map_or(true, |m| m >= 2))
}

/// Read the endorsement-key name via `tpm2_readpublic`.
#[cfg(target_os = "linux")]
pub async fn endorsement_key_hash(timeout: Duration) -> Result<Option<String>, HardwareError> {
    let output = super::command::run_command(
        "tpm2_readpublic",
        &["-c", EK_PERSISTENT_HANDLE],
        timeout,
    )
    .await?;
    Ok(parse_readpublic_name(&output))
}

/// Detect a TPM 2.0 device.
#[cfg(target_os = "windows")]
pub async fn detect_tpm(timeout: Duration) -> Result<bool, HardwareError> {
    let output = super::command::powershell(
        "$ErrorActionPreference='SilentlyContinue'; $t = Get-Tpm; if ($t) { $t.TpmPresent -and $t.TpmReady } else { $false }",
        timeout,
    )
    .await?;
    Ok(output.trim().eq_ignore_ascii_case("true"))
}

/// Read the SHA-256 endorsement-key public-key hash.
#[cfg(target_os = "windows")]
pub async fn endorsement_key_hash(timeout: Duration) -> Result<Option<String>, HardwareError> {
    let output = super::command::powershell(
        "Get-TpmEndorsementKeyInfo -HashAlgorithm Sha256 | Select-Object -ExpandProperty PublicKeyHash",
        timeout,
    )
    .await?;
    let hash = output.trim();
    Ok((!hash.is_empty()).then(|| hash.to_string()))
}

/// Detect a TPM 2.0 device.
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub async fn detect_tpm(_timeout: Duration) -> Result<bool, HardwareError> {
    Ok(false)
}

/// Read the endorsement-key hash.
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub async fn endorsement_key_hash(_timeout: Duration) -> Result<Option<String>, HardwareError> {
    Err(HardwareError::not_supported("tpm endorsement key"))
}

/// Extract the `name:` field (hash of the public area) from
/// `tpm2_readpublic` output.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_readpublic_name(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix("name:")?.trim();
        (!value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| value.to_string())
    })
}
