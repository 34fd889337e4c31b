//! Error types for hardware probing.

use thiserror::Error;

/// Errors that can occur while querying hardware or the operating system.
///
/// None of these escape [`HardwareIdentity::hardware_id`](crate::HardwareIdentity::hardware_id):
/// a failing probe only removes its component from the fingerprint.
#[derive(Debug, Error)]
pub enum HardwareError {
    /// The query is not implemented on this platform.
    #[error("Operation not supported on this platform: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// The query did not complete within its bound.
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        /// The probe that timed out.
        operation: String,
        /// The bound that was exceeded.
        timeout_ms: u64,
    },

    /// An external command could not be run or exited unsuccessfully.
    #[error("Command `{command}` failed: {message}")]
    CommandFailed {
        /// Program name.
        command: String,
        /// Exit status and stderr summary.
        message: String,
    },

    /// Probe output could not be interpreted.
    #[error("Could not parse {what}: {message}")]
    ParseError {
        /// Which output was being parsed.
        what: String,
        /// Parser detail.
        message: String,
    },

    /// The component exists but reported no usable value.
    #[error("{component} unavailable: {reason}")]
    Unavailable {
        /// Component name.
        component: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// Filesystem error while reading a system file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HardwareError {
    /// Create a not-supported error.
    #[must_use]
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// Create a parse error.
    #[must_use]
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseError {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Create an unavailable-component error.
    #[must_use]
    pub fn unavailable(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error was a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
