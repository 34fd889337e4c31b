//! Windows hardware facts from CIM classes and the registry.
//!
//! Every query goes through PowerShell and is rendered with `ConvertTo-Json`
//! so the parsers below can be exercised on any host.

use std::time::Duration;

use serde::Deserialize;

use crate::error::HardwareError;
use crate::types::{BiosDescriptor, BoardDescriptor, CpuDescriptor, OsDescriptor, SystemDescriptor};

#[cfg(target_os = "windows")]
use super::command::{powershell, run_command};

const CPU_QUERY: &str = "Get-CimInstance Win32_Processor | Select-Object -First 1 Manufacturer,Name,NumberOfLogicalProcessors | ConvertTo-Json -Compress";
const SYSTEM_QUERY: &str = "Get-CimInstance Win32_ComputerSystemProduct | Select-Object Vendor,Name,UUID | ConvertTo-Json -Compress";
const BOARD_QUERY: &str = "Get-CimInstance Win32_BaseBoard | Select-Object Manufacturer,Product,SerialNumber | ConvertTo-Json -Compress";
const BIOS_QUERY: &str = "Get-CimInstance Win32_BIOS | Select-Object Manufacturer,SerialNumber | ConvertTo-Json -Compress";
const DISK_QUERY: &str = "Get-CimInstance Win32_DiskDrive | Sort-Object Index | Select-Object -First 1 -ExpandProperty SerialNumber";
const OS_QUERY: &str = "Get-CimInstance Win32_OperatingSystem | Select-Object Caption,Version,OSArchitecture,TotalVisibleMemorySize | ConvertTo-Json -Compress";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Win32Processor {
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    number_of_logical_processors: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Win32ComputerSystemProduct {
    #[serde(rename = "Vendor", default)]
    vendor: Option<String>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "UUID", default)]
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Win32BaseBoard {
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Win32Bios {
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Win32OperatingSystem {
    #[serde(rename = "Caption", default)]
    caption: Option<String>,
    #[serde(rename = "Version", default)]
    version: Option<String>,
    #[serde(rename = "OSArchitecture", default)]
    os_architecture: Option<String>,
    #[serde(rename = "TotalVisibleMemorySize", default)]
    total_visible_memory_kib: Option<u64>,
}

fn clean(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn parse_json<'a, T: Deserialize<'a>>(what: &str, text: &'a str) -> Result<T, HardwareError> {
    serde_json::from_str(text).map_err(|e| HardwareError::parse(what, e.to_string()))
}

pub(crate) fn parse_cpu(text: &str) -> Result<CpuDescriptor, HardwareError> {
    let raw: Win32Processor = parse_json("Win32_Processor", text)?;
    Ok(CpuDescriptor {
        manufacturer: clean(raw.manufacturer),
        brand: clean(raw.name),
        cores: raw.number_of_logical_processors.unwrap_or(0),
    })
}

pub(crate) fn parse_system(text: &str) -> Result<SystemDescriptor, HardwareError> {
    let raw: Win32ComputerSystemProduct = parse_json("Win32_ComputerSystemProduct", text)?;
    Ok(SystemDescriptor {
        manufacturer: clean(raw.vendor),
        model: clean(raw.name),
        uuid: clean(raw.uuid),
    })
}

pub(crate) fn parse_board(text: &str) -> Result<BoardDescriptor, HardwareError> {
    let raw: Win32BaseBoard = parse_json("Win32_BaseBoard", text)?;
    Ok(BoardDescriptor {
        manufacturer: clean(raw.manufacturer),
        model: clean(raw.product),
        serial: clean(raw.serial_number),
    })
}

pub(crate) fn parse_bios(text: &str) -> Result<BiosDescriptor, HardwareError> {
    let raw: Win32Bios = parse_json("Win32_BIOS", text)?;
    Ok(BiosDescriptor {
        vendor: clean(raw.manufacturer),
        serial: clean(raw.serial_number),
    })
}

pub(crate) fn parse_os(text: &str) -> Result<(OsDescriptor, Option<u64>), HardwareError> {
    let raw: Win32OperatingSystem = parse_json("Win32_OperatingSystem", text)?;
    Ok((
        OsDescriptor {
            platform: "windows".to_string(),
            distro: clean(raw.caption),
            release: clean(raw.version),
            arch: clean(raw.os_architecture),
        },
        raw.total_visible_memory_kib.map(|kib| kib * 1024),
    ))
}

/// Extract `MachineGuid` from `reg query` output.
pub(crate) fn parse_machine_guid(text: &str) -> Option<String> {
    text.lines()
        .find(|l| l.contains("MachineGuid"))
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
}

// =============================================================================
// Probes
// =============================================================================

#[cfg(target_os = "windows")]
pub async fn cpu(timeout: Duration) -> Result<CpuDescriptor, HardwareError> {
    parse_cpu(&powershell(CPU_QUERY, timeout).await?)
}

#[cfg(target_os = "windows")]
pub async fn system(timeout: Duration) -> Result<SystemDescriptor, HardwareError> {
    parse_system(&powershell(SYSTEM_QUERY, timeout).await?)
}

#[cfg(target_os = "windows")]
pub async fn baseboard(timeout: Duration) -> Result<BoardDescriptor, HardwareError> {
    parse_board(&powershell(BOARD_QUERY, timeout).await?)
}

#[cfg(target_os = "windows")]
pub async fn bios(timeout: Duration) -> Result<BiosDescriptor, HardwareError> {
    parse_bios(&powershell(BIOS_QUERY, timeout).await?)
}

#[cfg(target_os = "windows")]
pub async fn first_disk_serial(timeout: Duration) -> Result<Option<String>, HardwareError> {
    let serial = powershell(DISK_QUERY, timeout).await?;
    Ok((!serial.is_empty()).then_some(serial))
}

#[cfg(target_os = "windows")]
pub async fn machine_id(timeout: Duration) -> Result<String, HardwareError> {
    let output = run_command(
        "reg",
        &[
            "query",
            r"HKLM\SOFTWARE\Microsoft\Cryptography",
            "/v",
            "MachineGuid",
        ],
        timeout,
    )
    .await?;
    parse_machine_guid(&output)
        .ok_or_else(|| HardwareError::parse("MachineGuid", "value not present in reg output"))
}

#[cfg(target_os = "windows")]
pub async fn os(timeout: Duration) -> Result<OsDescriptor, HardwareError> {
    Ok(parse_os(&powershell(OS_QUERY, timeout).await?)?.0)
}

#[cfg(target_os = "windows")]
pub async fn total_memory_bytes(timeout: Duration) -> Result<u64, HardwareError> {
    parse_os(&powershell(OS_QUERY, timeout).await?)?
        .1
        .ok_or_else(|| HardwareError::parse("Win32_OperatingSystem", "TotalVisibleMemorySize missing"))
}
