//! HMAC-SHA256 request and response signing.
//!
//! Outbound requests are signed over a pipe-delimited canonical string:
//!
//! ```text
//! METHOD|PATH|TIMESTAMP|NONCE|hex(SHA256(body))
//! ```
//!
//! Server responses are signed the same way with a fixed `RESPONSE` prefix:
//!
//! ```text
//! RESPONSE|PATH|TIMESTAMP|hex(SHA256(body))
//! ```
//!
//! Replay resistance rests on the timestamp window alone. There is no nonce
//! registry; a captured request can be replayed within the window.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::types::SecretString;
use crate::{constant_time_eq, sha256_hex};

type HmacSha256 = Hmac<Sha256>;

/// Default accepted clock skew for signed timestamps (5 minutes).
pub const DEFAULT_TIMESTAMP_TOLERANCE_MS: u64 = 5 * 60 * 1000;

/// Number of random bytes in a request nonce.
pub const NONCE_BYTES: usize = 16;

/// Generate a fresh request nonce: 16 random bytes, lowercase hex.
#[must_use]
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Keyed HMAC-SHA256 authenticator.
///
/// The key schedule is computed once; each tag clones the keyed state.
#[derive(Clone)]
pub struct MessageAuthenticator {
    mac: HmacSha256,
}

impl MessageAuthenticator {
    /// Build an authenticator from a shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the secret is empty.
    pub fn new(secret: &SecretString) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::invalid_key("shared secret is empty"));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.expose().as_bytes())
            .map_err(|e| CryptoError::invalid_key(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Lowercase hex HMAC tag over `message`.
    #[must_use]
    pub fn tag_hex(&self, message: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a hex tag in constant time. Hex case is ignored.
    #[must_use]
    pub fn verify_hex(&self, message: &[u8], tag: &str) -> bool {
        let expected = self.tag_hex(message);
        constant_time_eq(expected.as_bytes(), tag.to_ascii_lowercase().as_bytes())
    }
}

impl fmt::Debug for MessageAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageAuthenticator")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Signs outbound requests and checks signed responses with the
/// request-signing secret.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    auth: MessageAuthenticator,
}

impl RequestSigner {
    /// Create a signer from the request-signing secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the secret is empty.
    pub fn new(secret: &SecretString) -> Result<Self, CryptoError> {
        Ok(Self {
            auth: MessageAuthenticator::new(secret)?,
        })
    }

    /// Canonical string covered by a request signature.
    #[must_use]
    pub fn canonical_request(
        method: &str,
        path: &str,
        timestamp_ms: i64,
        nonce: &str,
        body: &[u8],
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            method.to_ascii_uppercase(),
            path,
            timestamp_ms,
            nonce,
            sha256_hex(body)
        )
    }

    /// Canonical string covered by a response signature.
    #[must_use]
    pub fn canonical_response(path: &str, timestamp: &str, body: &[u8]) -> String {
        format!("RESPONSE|{}|{}|{}", path, timestamp, sha256_hex(body))
    }

    /// Sign an outbound request. The body must be the exact bytes sent.
    #[must_use]
    pub fn sign(
        &self,
        method: &str,
        path: &str,
        timestamp_ms: i64,
        nonce: &str,
        body: &[u8],
    ) -> String {
        let canonical = Self::canonical_request(method, path, timestamp_ms, nonce, body);
        self.auth.tag_hex(canonical.as_bytes())
    }

    /// Compute the expected signature of a server response.
    #[must_use]
    pub fn sign_response(&self, path: &str, timestamp: &str, body: &[u8]) -> String {
        let canonical = Self::canonical_response(path, timestamp, body);
        self.auth.tag_hex(canonical.as_bytes())
    }

    /// Check a server response signature.
    #[must_use]
    pub fn verify_response(&self, path: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
        let canonical = Self::canonical_response(path, timestamp, body);
        self.auth.verify_hex(canonical.as_bytes(), signature)
    }

    /// Check a signed request, including the timestamp window.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::TimestampOutOfWindow`] when the timestamp is
    /// further than `tolerance_ms` from `now_ms`, and
    /// [`CryptoError::SignatureMismatch`] when the signature is wrong.
    #[allow(clippy::too_many_arguments)]
    pub fn verify_request(
        &self,
        method: &str,
        path: &str,
        timestamp_ms: i64,
        nonce: &str,
        body: &[u8],
        signature: &str,
        now_ms: i64,
        tolerance_ms: u64,
    ) -> Result<(), CryptoError> {
        let skew_ms = now_ms.abs_diff(timestamp_ms);
        if skew_ms > tolerance_ms {
            return Err(CryptoError::TimestampOutOfWindow {
                skew_ms,
                tolerance_ms,
            });
        }
        let canonical = Self::canonical_request(method, path, timestamp_ms, nonce, body);
        if self.auth.verify_hex(canonical.as_bytes(), signature) {
            Ok(())
        } else {
            Err(CryptoError::SignatureMismatch)
        }
    }
}
