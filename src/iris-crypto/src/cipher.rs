//! AES-256-GCM payload encryption.
//!
//! The key is derived once per cipher with scrypt over the shared secret and
//! a fixed salt. Each message gets a fresh random 16-byte IV. The wire form
//! carries IV, ciphertext and the 16-byte authentication tag as separate hex
//! fields:
//!
//! ```json
//! { "encrypted": true, "iv": "...", "data": "...", "tag": "..." }
//! ```

use std::fmt;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::types::SecretString;

/// AES-256-GCM with a 16-byte nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Fixed scrypt salt shared with the server.
pub const KEY_DERIVATION_SALT: &[u8] = b"iris-salt";

/// IV length in bytes.
pub const IV_LEN: usize = 16;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

const KEY_LEN: usize = 32;

// scrypt N = 2^14, r = 8, p = 1
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Encrypted envelope as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Always `true` for payloads produced by [`PayloadCipher`].
    pub encrypted: bool,
    /// Hex-encoded 16-byte IV.
    pub iv: String,
    /// Hex-encoded ciphertext.
    pub data: String,
    /// Hex-encoded 16-byte GCM tag.
    pub tag: String,
}

/// Authenticated payload cipher keyed from a shared secret.
pub struct PayloadCipher {
    cipher: Aes256Gcm16,
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("algorithm", &"AES-256-GCM")
            .finish()
    }
}

impl PayloadCipher {
    /// Derive the payload key from `secret` and build the cipher.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is empty or key derivation fails.
    pub fn new(secret: &SecretString) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::invalid_key("shared secret is empty"));
        }

        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN).map_err(|e| {
            CryptoError::KeyDerivationFailed {
                reason: e.to_string(),
            }
        })?;

        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(secret.expose().as_bytes(), KEY_DERIVATION_SALT, &params, &mut key).map_err(
            |e| CryptoError::KeyDerivationFailed {
                reason: e.to_string(),
            },
        )?;

        let cipher = Aes256Gcm16::new_from_slice(&key);
        key.zeroize();
        let cipher = cipher.map_err(|e| CryptoError::invalid_key(e.to_string()))?;

        Ok(Self { cipher })
    }

    /// Encrypt raw bytes under a fresh IV.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD rejects the input.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| CryptoError::EncryptionFailed {
                reason: e.to_string(),
            })?;

        Ok(EncryptedPayload {
            encrypted: true,
            iv: hex::encode(iv),
            data: hex::encode(buffer),
            tag: hex::encode(tag),
        })
    }

    /// Serialize `value` to JSON and encrypt it.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or encryption fails.
    pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncryptedPayload, CryptoError> {
        let plaintext = serde_json::to_vec(value)?;
        self.encrypt_bytes(&plaintext)
    }

    /// Authenticate and decrypt an envelope to raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedPayload`] for bad hex or lengths and
    /// [`CryptoError::DecryptionFailed`] when authentication fails.
    pub fn decrypt_bytes(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        let iv = decode_field("iv", &payload.iv)?;
        let tag = decode_field("tag", &payload.tag)?;
        let mut buffer = decode_field("data", &payload.data)?;

        if iv.len() != IV_LEN {
            return Err(CryptoError::malformed(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::malformed(format!(
                "tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }

        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(&tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(buffer)
    }

    /// Authenticate, decrypt and deserialize an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails or the plaintext is not the
    /// expected JSON shape.
    pub fn decrypt<T: DeserializeOwned>(&self, payload: &EncryptedPayload) -> Result<T, CryptoError> {
        let plaintext = self.decrypt_bytes(payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Open a JSON value that may or may not be an encrypted envelope.
    ///
    /// Values without `"encrypted": true` are returned untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the value claims to be encrypted but fails to open.
    pub fn open_value(&self, value: serde_json::Value) -> Result<serde_json::Value, CryptoError> {
        let is_envelope = value
            .get("encrypted")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !is_envelope {
            return Ok(value);
        }
        let payload: EncryptedPayload = serde_json::from_value(value)?;
        self.decrypt(&payload)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(value).map_err(|e| CryptoError::malformed(format!("{name}: {e}")))
}
