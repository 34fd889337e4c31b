//! # iris-crypto
//!
//! Cryptographic primitives for the Iris secure channel.
//!
//! - **Request signing**: HMAC-SHA256 over a canonical
//!   `METHOD|PATH|TIMESTAMP|NONCE|SHA256(body)` string, plus the matching
//!   `RESPONSE|...` check for signed server replies.
//! - **Payload encryption**: AES-256-GCM with a scrypt-derived key, random
//!   16-byte IV per message and a 16-byte tag validated on decrypt.
//! - **Client authenticity**: a second, distinct HMAC key used to sign
//!   challenge solutions.
//!
//! Secrets are passed in explicitly as [`SecretString`] values; nothing in
//! this crate reads process-wide state.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cipher;
mod error;
mod signing;
mod types;

pub use cipher::{EncryptedPayload, PayloadCipher, IV_LEN, KEY_DERIVATION_SALT, TAG_LEN};
pub use error::CryptoError;
pub use signing::{
    generate_nonce, MessageAuthenticator, RequestSigner, DEFAULT_TIMESTAMP_TOLERANCE_MS,
    NONCE_BYTES,
};
pub use types::SecretString;

use sha2::{Digest, Sha256};

/// Constant-time byte comparison.
///
/// Compares two byte slices in constant time to prevent timing attacks.
/// Returns `true` if the slices are equal, `false` otherwise.
///
/// # Security
///
/// This function MUST be used for all signature and MAC comparisons.
/// The length check still returns early, but length is not secret here.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Case-insensitive comparison of two hex digests in constant time.
#[must_use]
pub fn hex_digest_eq(a: &str, b: &str) -> bool {
    constant_time_eq(
        a.trim().to_ascii_lowercase().as_bytes(),
        b.trim().to_ascii_lowercase().as_bytes(),
    )
}
