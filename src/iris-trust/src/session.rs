//! Session persistence and reverification policy.
//!
//! The session lives in an opaque [`KeyValueStore`] under two keys: `user`
//! (the profile, including the hardware id it is bound to) and `token`.
//!
//! ```text
//! verify():
//!   no stored session          ──► NoSession
//!   TPM required but missing   ──► TpmBlocked        (cleared)
//!   stored hwid ≠ observed     ──► HardwareMismatch  (cleared)
//!   GET /session/verify
//!     ├─ success               ──► Success           (profile refreshed)
//!     ├─ 401/403 or !success   ──► AuthRejected      (cleared)
//!     ├─ connection failure    ──► Unreachable       (kept)
//!     └─ anything else         ──► OtherServerError  (kept)
//! ```
//!
//! A session is never discarded because the server could not be reached.

// Allow deprecated from_slice until chacha20poly1305 upgrades to generic-array 1.x
#![allow(deprecated)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, Utc};
use iris_crypto::CryptoError;
use iris_hardware::HardwareIdentity;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

use crate::channel::SecureChannel;
use crate::config::TrustConfig;
use crate::error::TrustError;
use crate::types::{Ack, RegisterHardwareRequest, Session, SessionVerifyResponse, UserProfile};

/// Store key for the cached profile.
pub const USER_KEY: &str = "user";

/// Store key for the bearer token.
pub const TOKEN_KEY: &str = "token";

/// Session verification endpoint.
pub const SESSION_VERIFY_PATH: &str = "/session/verify";

/// Hardware registration endpoint.
pub const REGISTER_HARDWARE_PATH: &str = "/register-hardware";

/// XChaCha20-Poly1305 nonce size (24 bytes)
const NONCE_SIZE: usize = 24;

/// File holding the per-installation identifier the store key derives from.
const INSTALLATION_ID_FILE: &str = "installation-id";

// =============================================================================
// Key-value stores
// =============================================================================

/// Opaque byte store keyed by name.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TrustError>;

    /// Write `key`.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), TrustError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), TrustError>;
}

/// In-memory store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TrustError> {
        Ok(self
            .entries
            .read()
            .map(|entries| entries.get(key).cloned())
            .unwrap_or(None))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), TrustError> {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), value.to_vec());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TrustError> {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
        Ok(())
    }
}

/// File-per-key store sealed with XChaCha20-Poly1305.
///
/// Each file holds `nonce || ciphertext`. The key is derived from a random
/// installation id created on first use, so copying the files to another
/// installation does not carry the session with them.
pub struct EncryptedFileStore {
    dir: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl EncryptedFileStore {
    /// Open (or create) a store in `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, TrustError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| TrustError::Store {
            message: format!("cannot create {}: {e}", dir.display()),
        })?;
        let installation_id = load_or_create_installation_id(&dir).await?;

        let mut hasher = Sha256::new();
        hasher.update(b"iris-session-key:");
        hasher.update(installation_id.as_bytes());
        let key = Zeroizing::new(hasher.finalize().into());

        debug!(dir = %dir.display(), "Session store opened");
        Ok(Self { dir, key })
    }

    /// Open the store under the configured data directory.
    pub async fn from_config(config: &TrustConfig) -> Result<Self, TrustError> {
        Self::open(config.data_dir.join("session")).await
    }

    /// Directory holding the sealed entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_slice());
        hasher.update(key.as_bytes());
        let name = hex::encode(&hasher.finalize()[..16]);
        self.dir.join(format!("{name}.session"))
    }

    /// Returns nonce || ciphertext.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TrustError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(self.key.as_slice())
            .map_err(|_| CryptoError::InvalidKey {
                reason: "session store key".into(),
            })?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed {
                reason: "session entry".into(),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        trace!(plaintext_len = plaintext.len(), sealed_len = sealed.len(), "Session store: sealed entry");
        Ok(sealed)
    }

    /// Expects nonce || ciphertext.
    fn open_sealed(&self, data: &[u8]) -> Result<Vec<u8>, TrustError> {
        if data.len() < NONCE_SIZE {
            warn!(data_len = data.len(), "Session store: entry too short to contain nonce");
            return Err(CryptoError::DecryptionFailed.into());
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(self.key.as_slice())
            .map_err(|_| CryptoError::InvalidKey {
                reason: "session store key".into(),
            })?;
        cipher.decrypt(nonce, ciphertext).map_err(|_| {
            warn!("Session store: decryption failed (possible tampering)");
            TrustError::from(CryptoError::DecryptionFailed)
        })
    }
}

#[async_trait]
impl KeyValueStore for EncryptedFileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TrustError> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(data) => self.open_sealed(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TrustError::Store {
                message: format!("cannot read '{key}': {e}"),
            }),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), TrustError> {
        let sealed = self.seal(value)?;
        let path = self.entry_path(key);
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, &sealed).await.map_err(|e| TrustError::Store {
            message: format!("cannot write '{key}': {e}"),
        })?;
        tokio::fs::rename(&staging, &path).await.map_err(|e| TrustError::Store {
            message: format!("cannot commit '{key}': {e}"),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), TrustError> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TrustError::Store {
                message: format!("cannot delete '{key}': {e}"),
            }),
        }
    }
}

async fn load_or_create_installation_id(dir: &Path) -> Result<String, TrustError> {
    let path = dir.join(INSTALLATION_ID_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => warn!(path = %path.display(), "Empty installation id, regenerating"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => {
            return Err(TrustError::Store {
                message: format!("cannot read installation id: {e}"),
            })
        },
    }

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let id = hex::encode(bytes);
    tokio::fs::write(&path, &id).await.map_err(|e| TrustError::Store {
        message: format!("cannot write installation id: {e}"),
    })?;
    info!(path = %path.display(), "Created installation id");
    Ok(id)
}

// =============================================================================
// Session manager
// =============================================================================

/// Persisted form of the `token` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredToken {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Result of [`SessionManager::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Nothing stored.
    NoSession,
    /// A TPM is required and none is available. Session cleared.
    TpmBlocked {
        /// What the user should do.
        remediation: String,
    },
    /// The session belongs to different hardware. Session cleared.
    HardwareMismatch {
        /// Hardware id stored with the session.
        stored: String,
        /// Hardware id observed now.
        observed: String,
    },
    /// The server accepted the session.
    Success {
        /// Refreshed profile.
        profile: UserProfile,
    },
    /// The server rejected the session. Session cleared.
    AuthRejected {
        /// Server-supplied reason.
        reason: Option<String>,
    },
    /// The server could not be reached. Session kept.
    Unreachable {
        /// What failed.
        message: String,
    },
    /// Any other server failure. Session kept.
    OtherServerError {
        /// HTTP status, if one was received.
        status: Option<u16>,
        /// What went wrong.
        reason: String,
    },
}

impl VerificationOutcome {
    /// Whether the session was confirmed by the server.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Whether this outcome discarded the stored session.
    #[must_use]
    pub fn clears_session(&self) -> bool {
        matches!(
            self,
            Self::TpmBlocked { .. } | Self::HardwareMismatch { .. } | Self::AuthRejected { .. }
        )
    }
}

/// Owns the stored session and applies the reverification policy.
pub struct SessionManager {
    channel: Arc<SecureChannel>,
    identity: HardwareIdentity,
    store: Arc<dyn KeyValueStore>,
    require_tpm: bool,
    writes: Mutex<()>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("require_tpm", &self.require_tpm)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over `store`.
    pub fn new(
        config: &TrustConfig,
        channel: Arc<SecureChannel>,
        identity: HardwareIdentity,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            channel,
            identity,
            store,
            require_tpm: config.require_tpm,
            writes: Mutex::new(()),
        }
    }

    /// Load the stored session, if complete and readable.
    ///
    /// A corrupt or half-written session reads as absent.
    pub async fn current(&self) -> Result<Option<Session>, TrustError> {
        let user = self.store.get(USER_KEY).await?;
        let token = self.store.get(TOKEN_KEY).await?;
        let (Some(user), Some(token)) = (user, token) else {
            return Ok(None);
        };

        let profile: UserProfile = match serde_json::from_slice(&user) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Stored profile unreadable");
                return Ok(None);
            },
        };
        let token: StoredToken = match serde_json::from_slice(&token) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Stored token unreadable");
                return Ok(None);
            },
        };

        Ok(Some(Session {
            token: token.token,
            profile,
            expires_at: token.expires_at,
        }))
    }

    /// Re-verify the stored session.
    #[instrument(skip(self))]
    pub async fn verify(&self) -> VerificationOutcome {
        let _writer = self.writes.lock().await;

        let session = match self.current().await {
            Ok(Some(s)) => s,
            Ok(None) => return VerificationOutcome::NoSession,
            Err(e) => {
                warn!(error = %e, "Session store unreadable");
                return VerificationOutcome::NoSession;
            },
        };

        if self.require_tpm && !self.identity.check_tpm_availability().await {
            warn!(user_id = %session.user_id(), "TPM required but unavailable; clearing session");
            self.clear().await;
            return VerificationOutcome::TpmBlocked {
                remediation: "This account requires a TPM 2.0 device. Enable TPM in your firmware settings and sign in again."
                    .into(),
            };
        }

        let observed = self.identity.hardware_id().await.hash;
        if observed != session.hardware_id() {
            warn!(
                stored = %session.hardware_id(),
                observed = %observed,
                "Session bound to different hardware; clearing"
            );
            self.clear().await;
            return VerificationOutcome::HardwareMismatch {
                stored: session.hardware_id().to_string(),
                observed,
            };
        }

        match self
            .channel
            .get_json::<SessionVerifyResponse>(SESSION_VERIFY_PATH, Some(&session.token))
            .await
        {
            Ok(SessionVerifyResponse {
                success: true,
                user,
                ..
            }) => {
                let profile = merge_profile(session.profile, user);
                if let Err(e) = self.write_profile(&profile).await {
                    warn!(error = %e, "Failed to persist refreshed profile");
                }
                info!(user_id = %profile.id, "Session verified");
                VerificationOutcome::Success { profile }
            },
            Ok(rejected) => {
                warn!(reason = ?rejected.reason, "Session rejected by server; clearing");
                self.clear().await;
                VerificationOutcome::AuthRejected {
                    reason: rejected.reason.or(rejected.message),
                }
            },
            Err(e) if e.is_auth_rejection() => {
                warn!(error = %e, "Session rejected by server; clearing");
                self.clear().await;
                VerificationOutcome::AuthRejected {
                    reason: rejection_reason(&e),
                }
            },
            Err(TrustError::Unreachable { message }) => {
                warn!(message = %message, "Server unreachable; keeping session");
                VerificationOutcome::Unreachable { message }
            },
            Err(TrustError::HttpStatus { status, body }) => {
                warn!(status, "Session verification failed; keeping session");
                VerificationOutcome::OtherServerError {
                    status: Some(status),
                    reason: server_reason(&body).unwrap_or_else(|| format!("HTTP {status}")),
                }
            },
            Err(e) => {
                warn!(error = %e, "Session verification failed; keeping session");
                VerificationOutcome::OtherServerError {
                    status: None,
                    reason: e.to_string(),
                }
            },
        }
    }

    /// Bind `token` to this machine and persist the session.
    ///
    /// Registers the observed hardware id with the server first; nothing is
    /// stored unless registration succeeds.
    #[instrument(skip(self, token, profile), fields(user_id = %profile.id))]
    pub async fn login(
        &self,
        token: &str,
        mut profile: UserProfile,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Session, TrustError> {
        let _writer = self.writes.lock().await;

        let (fingerprint, system_info) = tokio::join!(self.identity.hardware_id(), self.identity.system_info());
        let request = RegisterHardwareRequest {
            hardware_id: fingerprint.hash.clone(),
            system_info,
        };
        let ack: Ack = self
            .channel
            .post_json(REGISTER_HARDWARE_PATH, &request, Some(token))
            .await?;
        if !ack.success {
            return Err(TrustError::InvalidResponse {
                endpoint: REGISTER_HARDWARE_PATH.into(),
                message: ack.message.unwrap_or_else(|| "Hardware registration failed".into()),
            });
        }

        profile.hardware_id = fingerprint.hash;
        let stored = StoredToken {
            token: token.to_string(),
            expires_at,
        };
        self.write_profile(&profile).await?;
        self.store
            .set(TOKEN_KEY, &serde_json::to_vec(&stored).map_err(CryptoError::from)?)
            .await?;

        info!(kind = fingerprint.kind.as_str(), "Session stored");
        Ok(Session {
            token: stored.token,
            profile,
            expires_at,
        })
    }

    /// Exchange a freshly issued token for a profile, then [`login`](Self::login).
    #[instrument(skip(self, token))]
    pub async fn login_with_token(&self, token: &str) -> Result<Session, TrustError> {
        let response: SessionVerifyResponse = self.channel.get_json(SESSION_VERIFY_PATH, Some(token)).await?;
        match response {
            SessionVerifyResponse {
                success: true,
                user: Some(user),
                ..
            } => self.login(token, user, None).await,
            rejected => Err(TrustError::InvalidResponse {
                endpoint: SESSION_VERIFY_PATH.into(),
                message: rejected
                    .message
                    .or(rejected.reason)
                    .unwrap_or_else(|| "Token verification failed".into()),
            }),
        }
    }

    /// Remove the stored session.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), TrustError> {
        let _writer = self.writes.lock().await;
        self.store.delete(USER_KEY).await?;
        self.store.delete(TOKEN_KEY).await?;
        info!("Session cleared");
        Ok(())
    }

    async fn write_profile(&self, profile: &UserProfile) -> Result<(), TrustError> {
        let bytes = serde_json::to_vec(profile).map_err(CryptoError::from)?;
        self.store.set(USER_KEY, &bytes).await
    }

    /// Best-effort clear while already holding the writer lock.
    async fn clear(&self) {
        for key in [USER_KEY, TOKEN_KEY] {
            if let Err(e) = self.store.delete(key).await {
                warn!(key, error = %e, "Failed to clear session entry");
            }
        }
    }
}

/// Server fields win, except that the hardware binding stays local.
fn merge_profile(cached: UserProfile, fresh: Option<UserProfile>) -> UserProfile {
    match fresh {
        Some(mut fresh) => {
            fresh.hardware_id = cached.hardware_id;
            if fresh.id.is_empty() {
                fresh.id = cached.id;
            }
            fresh
        },
        None => cached,
    }
}

fn rejection_reason(error: &TrustError) -> Option<String> {
    match error {
        TrustError::HttpStatus { body, .. } => server_reason(body),
        _ => None,
    }
}

/// `reason` or `message` from a JSON error body.
fn server_reason(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["reason", "message"]
        .iter()
        .find_map(|k| value.get(k).and_then(|v| v.as_str()).map(str::to_string))
}
