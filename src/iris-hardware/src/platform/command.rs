//! Bounded external command execution.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::HardwareError;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Run `program` with `args` and return trimmed stdout.
///
/// The child is killed if `timeout` elapses or the future is dropped.
///
/// # Errors
///
/// Returns [`HardwareError::Timeout`] when the bound is exceeded and
/// [`HardwareError::CommandFailed`] for spawn failures or non-zero exit.
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, HardwareError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "windows")]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(HardwareError::CommandFailed {
                command: program.to_string(),
                message: e.to_string(),
            })
        },
        Err(_) => {
            return Err(HardwareError::Timeout {
                operation: program.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        },
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HardwareError::CommandFailed {
            command: program.to_string(),
            message: format!("{}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a PowerShell script non-interactively.
///
/// # Errors
///
/// Same as [`run_command`].
pub async fn powershell(script: &str, timeout: Duration) -> Result<String, HardwareError> {
    run_command(
        "powershell",
        &[
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script,
        ],
        timeout,
    )
    .await
}
