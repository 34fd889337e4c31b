//! Linux hardware facts from sysfs and procfs.

use std::path::Path;

use crate::error::HardwareError;
use crate::types::{BiosDescriptor, BoardDescriptor, CpuDescriptor, OsDescriptor, SystemDescriptor};

const DMI_ROOT: &str = "/sys/class/dmi/id";

/// Block device prefixes that are never physical disks.
const VIRTUAL_BLOCK_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr", "fd"];

async fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    let value = tokio::fs::read_to_string(path).await.ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

async fn dmi(attribute: &str) -> Option<String> {
    read_trimmed(Path::new(DMI_ROOT).join(attribute))
        .await
        .filter(|v| !is_placeholder(v))
}

/// OEM placeholder strings that carry no identity.
fn is_placeholder(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower == "default string"
        || lower == "to be filled by o.e.m."
        || lower == "not specified"
        || lower == "none"
        || lower.chars().all(|c| c == '0' || c == '-')
}

pub async fn cpu() -> Result<CpuDescriptor, HardwareError> {
    let text = tokio::fs::read_to_string("/proc/cpuinfo").await?;
    parse_cpuinfo(&text)
}

pub async fn system() -> Result<SystemDescriptor, HardwareError> {
    let descriptor = SystemDescriptor {
        manufacturer: dmi("sys_vendor").await.unwrap_or_default(),
        model: dmi("product_name").await.unwrap_or_default(),
        // product_uuid is root-only on most distributions
        uuid: dmi("product_uuid").await.unwrap_or_default(),
    };
    if descriptor == SystemDescriptor::default() {
        return Err(HardwareError::unavailable("system", "no DMI product attributes readable"));
    }
    Ok(descriptor)
}

pub async fn baseboard() -> Result<BoardDescriptor, HardwareError> {
    let descriptor = BoardDescriptor {
        manufacturer: dmi("board_vendor").await.unwrap_or_default(),
        model: dmi("board_name").await.unwrap_or_default(),
        serial: dmi("board_serial").await.unwrap_or_default(),
    };
    if descriptor == BoardDescriptor::default() {
        return Err(HardwareError::unavailable("baseboard", "no DMI board attributes readable"));
    }
    Ok(descriptor)
}

pub async fn bios() -> Result<BiosDescriptor, HardwareError> {
    let descriptor = BiosDescriptor {
        vendor: dmi("bios_vendor").await.unwrap_or_default(),
        serial: dmi("product_serial").await.unwrap_or_default(),
    };
    if descriptor == BiosDescriptor::default() {
        return Err(HardwareError::unavailable("bios", "no DMI firmware attributes readable"));
    }
    Ok(descriptor)
}

pub async fn first_disk_serial() -> Result<Option<String>, HardwareError> {
    let mut entries = tokio::fs::read_dir("/sys/block").await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !VIRTUAL_BLOCK_PREFIXES.iter().any(|p| name.starts_with(p)) {
            names.push(name);
        }
    }
    names.sort();

    for name in names {
        let device = Path::new("/sys/block").join(&name).join("device");
        for attribute in ["serial", "wwid"] {
            if let Some(serial) = read_trimmed(device.join(attribute)).await {
                return Ok(Some(serial));
            }
        }
    }
    Ok(None)
}

pub async fn machine_id() -> Result<String, HardwareError> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Some(id) = read_trimmed(path).await {
            return Ok(id);
        }
    }
    Err(HardwareError::unavailable("machine id", "no machine-id file"))
}

pub async fn os() -> Result<OsDescriptor, HardwareError> {
    let distro = match tokio::fs::read_to_string("/etc/os-release").await {
        Ok(text) => parse_os_release(&text).unwrap_or_else(|| "Linux".to_string()),
        Err(_) => "Linux".to_string(),
    };
    let release = read_trimmed("/proc/sys/kernel/osrelease").await.unwrap_or_default();
    Ok(OsDescriptor {
        platform: std::env::consts::OS.to_string(),
        distro,
        release,
        arch: std::env::consts::ARCH.to_string(),
    })
}

pub async fn total_memory_bytes() -> Result<u64, HardwareError> {
    let text = tokio::fs::read_to_string("/proc/meminfo").await?;
    parse_meminfo_total(&text)
}

// =============================================================================
// Parsers
// =============================================================================

pub(crate) fn parse_cpuinfo(text: &str) -> Result<CpuDescriptor, HardwareError> {
    let mut manufacturer = String::new();
    let mut brand = String::new();
    let mut cores = 0u32;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => cores += 1,
            "vendor_id" | "CPU implementer" if manufacturer.is_empty() => {
                manufacturer = value.trim().to_string();
            },
            "model name" | "Model" if brand.is_empty() => {
                brand = value.trim().to_string();
            },
            _ => {},
        }
    }

    if cores == 0 && brand.is_empty() {
        return Err(HardwareError::parse("/proc/cpuinfo", "no processor entries"));
    }
    Ok(CpuDescriptor {
        manufacturer,
        brand,
        cores,
    })
}

pub(crate) fn parse_meminfo_total(text: &str) -> Result<u64, HardwareError> {
    let line = text
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .ok_or_else(|| HardwareError::parse("/proc/meminfo", "MemTotal missing"))?;
    let kib = line
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| HardwareError::parse("/proc/meminfo", "MemTotal not numeric"))?;
    Ok(kib * 1024)
}

pub(crate) fn parse_os_release(text: &str) -> Option<String> {
    let mut name = None;
    for line in text.lines() {
        if let Some(v) = line.strip_prefix("PRETTY_NAME=") {
            return Some(v.trim_matches('"').to_string());
        }
        if let Some(v) = line.strip_prefix("NAME=") {
            name = Some(v.trim_matches('"').to_string());
        }
    }
    name
}
