//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during signing, verification, or payload encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key could not be constructed from the supplied material.
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Reason the key is invalid.
        reason: String,
    },

    /// Deriving the payload key from the shared secret failed.
    #[error("Key derivation failed: {reason}")]
    KeyDerivationFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Encryption failed.
    #[error("Encryption failed: {reason}")]
    EncryptionFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Authenticated decryption failed (wrong key, tampered IV, ciphertext or tag).
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// The encrypted envelope is structurally invalid.
    #[error("Malformed encrypted payload: {reason}")]
    MalformedPayload {
        /// What is wrong with the envelope.
        reason: String,
    },

    /// A request or response signature did not match.
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// A signed timestamp falls outside the accepted window.
    #[error("Timestamp outside tolerance window (skew {skew_ms} ms, allowed {tolerance_ms} ms)")]
    TimestampOutOfWindow {
        /// Absolute distance between the signed timestamp and now.
        skew_ms: u64,
        /// Configured tolerance.
        tolerance_ms: u64,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CryptoError {
    /// Create an invalid key error.
    #[must_use]
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Create a malformed payload error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    /// Whether this error indicates tampering rather than a local fault.
    #[must_use]
    pub fn is_tamper_evidence(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed | Self::SignatureMismatch | Self::TimestampOutOfWindow { .. }
        )
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}
