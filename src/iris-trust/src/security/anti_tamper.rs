//! Anti-debugging heuristics.
//!
//! Detects:
//! - Execution slowed by breakpoints or single-stepping (timing probe)
//! - Known reversing and traffic-interception tools in the process list
//! - A tracer attached to this process (Linux `TracerPid`)
//!
//! The results are informational evidence for the server. They never gate
//! anything locally, and a failing check degrades to "not detected".

use std::time::{Duration, Instant};

use iris_hardware::HardwareError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Process image names of common debugging and reversing tools.
pub const SUSPICIOUS_TOOLS: &[&str] = &[
    "ollydbg",
    "x64dbg",
    "x32dbg",
    "ida",
    "ida64",
    "wireshark",
    "fiddler",
    "charles",
    "processhacker",
    "procmon",
    "apimonitor",
    "cheatengine",
    "dnspy",
];

/// Iterations of the timing probe loop.
const TIMING_ITERATIONS: u64 = 1000;

/// Debugging evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugChecks {
    /// A tracer is attached to this process.
    pub debugger_attached: bool,
    /// A known tool is running.
    pub suspicious_process: bool,
    /// The timing probe ran slower than the threshold.
    pub time_anomaly: bool,
    /// Which tools were seen.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_seen: Vec<String>,
}

impl DebugChecks {
    /// Any heuristic fired.
    #[must_use]
    pub fn any(&self) -> bool {
        self.debugger_attached || self.suspicious_process || self.time_anomaly
    }
}

/// Run all heuristics.
pub async fn detect_debugging(threshold: Duration, scan_timeout: Duration) -> DebugChecks {
    let time_anomaly = check_timing_anomaly(threshold);

    let tools_seen = match list_processes(scan_timeout).await {
        Ok(listing) => find_suspicious(&listing),
        Err(e) => {
            debug!(error = %e, "Process scan unavailable");
            Vec::new()
        },
    };

    let checks = DebugChecks {
        debugger_attached: tracer_attached().await,
        suspicious_process: !tools_seen.is_empty(),
        time_anomaly,
        tools_seen,
    };
    if checks.any() {
        warn!(
            debugger = checks.debugger_attached,
            tools = ?checks.tools_seen,
            timing = checks.time_anomaly,
            "Debugging indicators present"
        );
    }
    checks
}

/// A fixed busy loop that should take well under a millisecond.
pub fn check_timing_anomaly(threshold: Duration) -> bool {
    let start = Instant::now();
    let mut sum = 0u64;
    for i in 0..TIMING_ITERATIONS {
        sum = sum.wrapping_add(std::hint::black_box(i));
    }
    let elapsed = start.elapsed();
    std::hint::black_box(sum);
    elapsed > threshold
}

/// Names of known tools present in a process listing.
///
/// Matching is per process name (extension and path stripped), so a tool
/// name inside an unrelated process name does not count.
#[must_use]
pub fn find_suspicious(listing: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for name in process_names(listing) {
        let base = name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(name.as_str())
            .to_ascii_lowercase();
        let stem = base.trim_end_matches(".exe");
        for tool in SUSPICIOUS_TOOLS {
            let hit = stem == *tool || (tool.len() > 4 && stem.starts_with(*tool));
            if hit && !seen.iter().any(|s| s == tool) {
                seen.push((*tool).to_string());
            }
        }
    }
    seen
}

/// First column of a `tasklist /FO CSV` listing, or one name per line.
fn process_names(listing: &str) -> impl Iterator<Item = String> + '_ {
    listing.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let first = if line.starts_with('"') {
            line.split("\",\"").next().unwrap_or(line).trim_matches('"')
        } else {
            line
        };
        Some(first.to_ascii_lowercase())
    })
}

#[cfg(target_os = "windows")]
async fn list_processes(timeout: Duration) -> Result<String, HardwareError> {
    iris_hardware::platform::run_command("tasklist", &["/FO", "CSV", "/NH"], timeout).await
}

#[cfg(target_os = "linux")]
async fn list_processes(timeout: Duration) -> Result<String, HardwareError> {
    let scan = async {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir("/proc").await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let is_pid = file_name.to_str().is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            if let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await {
                names.push(comm.trim().to_string());
            }
        }
        Ok::<_, HardwareError>(names.join("\n"))
    };
    tokio::time::timeout(timeout, scan).await.map_err(|_| HardwareError::Timeout {
        operation: "process scan".into(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    })?
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
async fn list_processes(_timeout: Duration) -> Result<String, HardwareError> {
    Err(HardwareError::not_supported("process scan"))
}

#[cfg(target_os = "linux")]
async fn tracer_attached() -> bool {
    tokio::fs::read_to_string("/proc/self/status")
        .await
        .ok()
        .and_then(|status| parse_tracer_pid(&status))
        .is_some_and(|pid| pid != 0)
}

#[cfg(not(target_os = "linux"))]
async fn tracer_attached() -> bool {
    false
}

/// `TracerPid` from `/proc/<pid>/status`.
#[must_use]
pub fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|v| v.trim().parse().ok())
}
