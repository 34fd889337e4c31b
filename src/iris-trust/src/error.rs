//! Error types for trust-layer operations.

use thiserror::Error;

/// Errors that can occur in the trust layer.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The API could not be reached (DNS, connect, TLS handshake, timeout).
    #[error("API unreachable: {message}")]
    Unreachable {
        /// Transport-level description.
        message: String,
    },

    /// The API answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Invalid response from {endpoint}: {message}")]
    InvalidResponse {
        /// Endpoint path.
        endpoint: String,
        /// Decoder error.
        message: String,
    },

    /// Something that must be authentic did not verify: a pinned certificate,
    /// an enforced response signature, or a downloaded artifact hash.
    #[error("Integrity mismatch: {message}")]
    IntegrityMismatch {
        /// What failed to verify.
        message: String,
    },

    /// A local probe did not finish inside its timeout tier.
    #[error("Probe '{probe}' timed out after {timeout_ms}ms")]
    ProbeTimeout {
        /// Probe name.
        probe: String,
        /// Timeout applied.
        timeout_ms: u64,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong.
        message: String,
        /// What the user can do about it.
        remediation: String,
    },

    /// Local session store failure.
    #[error("Session store error: {message}")]
    Store {
        /// Error message.
        message: String,
    },

    /// Update pipeline failure outside of hash verification.
    #[error("Update error: {message}")]
    Update {
        /// Error message.
        message: String,
    },

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] iris_crypto::CryptoError),

    /// Hardware probe error.
    #[error("Hardware error: {0}")]
    Hardware(#[from] iris_hardware::HardwareError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrustError {
    /// Build a [`TrustError::Config`].
    pub fn config(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    /// Build a [`TrustError::IntegrityMismatch`].
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::IntegrityMismatch {
            message: message.into(),
        }
    }

    /// Transient failures where keeping local state and retrying later is correct.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable { .. } | Self::ProbeTimeout { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The server rejected our credentials.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 401 | 403, .. })
    }

    /// Evidence of tampering; callers discard the artifact and log an incident.
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            Self::IntegrityMismatch { .. } => true,
            Self::Crypto(e) => e.is_tamper_evidence(),
            _ => false,
        }
    }

    /// Plain-language text suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Unreachable { .. } => {
                "Cannot reach the Iris servers. Check your internet connection and try again.".into()
            },
            Self::HttpStatus { status: 401 | 403, .. } => {
                "Your session is no longer valid. Please sign in again.".into()
            },
            Self::HttpStatus { status, .. } if *status >= 500 => {
                "The Iris servers are having trouble. Please try again in a few minutes.".into()
            },
            Self::IntegrityMismatch { .. } => {
                "A security check failed. Reinstall Iris from the official site.".into()
            },
            Self::Config {
                message,
                remediation,
            } => format!("{message}. {remediation}"),
            _ => "Something went wrong. Please try again.".into(),
        }
    }
}

/// Truncate a response body for inclusion in an error.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
