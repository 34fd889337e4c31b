//! Wire types for the Iris API.
//!
//! Field names follow the API's camelCase convention. Server-issued
//! expiry timestamps are accepted either as epoch milliseconds or as
//! RFC 3339 strings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use iris_hardware::SystemInfo;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TrustError;
use crate::security::{ParsedPosture, SecurityAttestation};

// =============================================================================
// Challenge-response authentication
// =============================================================================

/// `POST /auth/challenge` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    /// Observed hardware fingerprint hash.
    pub hardware_id: String,
    /// Client version.
    pub version: String,
    /// Combined code-integrity hash.
    pub code_hash: String,
}

/// `POST /auth/challenge` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    /// Whether a challenge was issued.
    #[serde(default)]
    pub success: bool,
    /// Opaque challenge value.
    #[serde(default)]
    pub challenge: Option<String>,
    /// Time after which the challenge is void.
    #[serde(default, with = "flexible_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Server message on failure.
    #[serde(default)]
    pub message: Option<String>,
}

/// Server-issued challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Opaque challenge value.
    pub value: String,
    /// Time after which the challenge is void.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Challenge {
    /// Whether the challenge has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }
}

/// The fields covered by a challenge-solution signature.
///
/// Field order is significant: the signature is computed over the compact
/// JSON serialization of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionPayload {
    /// Challenge value being answered.
    pub challenge: String,
    /// Observed hardware fingerprint hash.
    pub hardware_id: String,
    /// Local time the solution was built, epoch milliseconds.
    pub timestamp: i64,
    /// Combined code-integrity hash.
    pub code_hash: String,
    /// Client version.
    pub version: String,
    /// Client process id.
    pub pid: u32,
}

/// `POST /auth/verify` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSolution {
    /// Signed fields.
    #[serde(flatten)]
    pub payload: SolutionPayload,
    /// HMAC-SHA256 over the payload with the client-authenticity secret.
    pub signature: String,
    /// Per-file code-integrity hashes.
    pub file_hashes: BTreeMap<String, String>,
}

/// `POST /auth/verify` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthVerifyResponse {
    /// Whether the solution was accepted.
    #[serde(default)]
    pub success: bool,
    /// Session token on success.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Session expiry on success.
    #[serde(default, with = "flexible_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Machine-readable rejection reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable rejection message.
    #[serde(default)]
    pub message: Option<String>,
    /// The server has blocked this client; do not retry.
    #[serde(default)]
    pub blocked: bool,
}

// =============================================================================
// Session
// =============================================================================

/// Cached user profile, bound to the hardware it was registered on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Platform user id.
    #[serde(alias = "_id")]
    pub id: String,
    /// Linked Discord account id.
    #[serde(default)]
    pub discord_id: Option<String>,
    /// Display name.
    pub username: String,
    /// Avatar URL.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Hardware fingerprint hash the session is bound to.
    #[serde(default)]
    pub hardware_id: String,
}

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token.
    pub token: String,
    /// Cached profile, including the bound hardware id.
    pub profile: UserProfile,
    /// Token expiry if the server supplied one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Platform user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.profile.id
    }

    /// Hardware fingerprint hash the session is bound to.
    #[must_use]
    pub fn hardware_id(&self) -> &str {
        &self.profile.hardware_id
    }
}

/// `GET /session/verify` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionVerifyResponse {
    /// Whether the session is still valid.
    #[serde(default)]
    pub success: bool,
    /// Fresh profile data.
    #[serde(default)]
    pub user: Option<UserProfile>,
    /// Machine-readable rejection reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST /register-hardware` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterHardwareRequest {
    /// Observed hardware fingerprint hash.
    pub hardware_id: String,
    /// Hardware snapshot for server-side plausibility checks.
    pub system_info: SystemInfo,
}

/// Generic `{success, message}` acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the request was accepted.
    #[serde(default)]
    pub success: bool,
    /// Server message.
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Heartbeat
// =============================================================================

/// `POST /heartbeat` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// Observed hardware fingerprint hash.
    pub hardware_id: String,
    /// Structured posture at the time of the report.
    pub security: ParsedPosture,
    /// Present when the posture moved since the last report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<HeartbeatSystemInfo>,
    /// Full attestation the posture was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<SecurityAttestation>,
}

/// Posture transitions attached to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSystemInfo {
    /// One `"<signal>: <before> -> <after>"` line per changed signal.
    pub security_changes: Vec<String>,
}

/// `POST /heartbeat` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    /// Whether the report was accepted.
    #[serde(default)]
    pub success: bool,
    /// Server instructions for the next cycles.
    #[serde(default)]
    pub data: Option<HeartbeatDirectives>,
    /// Server message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Server-driven heartbeat settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatDirectives {
    /// Report posture on every cycle instead of every n-th one.
    #[serde(default)]
    pub scan_mode_enabled: Option<bool>,
}

// =============================================================================
// Updates
// =============================================================================

/// `POST /updates/check` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckRequest {
    /// Running client version.
    pub version: String,
    /// Platform name.
    pub platform: String,
}

/// `POST /updates/check` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckResponse {
    /// Whether the check succeeded.
    #[serde(default)]
    pub success: bool,
    /// Whether a newer build exists.
    #[serde(default)]
    pub update_available: bool,
    /// New version.
    #[serde(default)]
    pub version: Option<String>,
    /// Artifact URL.
    #[serde(default)]
    pub download_url: Option<String>,
    /// Artifact size in bytes.
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Expected SHA-256 of the artifact.
    #[serde(default)]
    pub file_hash: Option<String>,
    /// Release notes.
    #[serde(default)]
    pub changelog: Option<String>,
    /// Whether the client must update to keep running.
    #[serde(default)]
    pub mandatory: bool,
}

impl UpdateCheckResponse {
    /// Convert into a manifest if the reply announces an update.
    ///
    /// An announced update missing its version, URL or hash cannot be
    /// verified. Optional ones are dropped with a warning; a mandatory one is
    /// an error so it is never mistaken for "up to date".
    pub fn into_manifest(self) -> Result<Option<UpdateManifest>, TrustError> {
        if !(self.success && self.update_available) {
            return Ok(None);
        }
        let missing: Vec<&str> = [
            ("version", self.version.is_none()),
            ("downloadUrl", self.download_url.is_none()),
            ("fileHash", self.file_hash.as_deref().map_or(true, str::is_empty)),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();

        match (self.version, self.download_url, self.file_hash) {
            (Some(version), Some(download_url), Some(file_hash)) if missing.is_empty() => Ok(Some(UpdateManifest {
                version,
                download_url,
                file_size: self.file_size,
                file_hash,
                changelog: self.changelog.unwrap_or_default(),
                mandatory: self.mandatory,
            })),
            _ if self.mandatory => {
                warn!(missing = ?missing, "Mandatory update announced without a verifiable manifest");
                Err(TrustError::Update {
                    message: format!("mandatory update manifest is missing {}", missing.join(", ")),
                })
            },
            _ => {
                warn!(missing = ?missing, "Optional update announced without a verifiable manifest; ignoring");
                Ok(None)
            },
        }
    }
}

/// An available update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    /// New version.
    pub version: String,
    /// Artifact URL.
    pub download_url: String,
    /// Artifact size in bytes.
    pub file_size: Option<u64>,
    /// Expected SHA-256 of the artifact, hex.
    pub file_hash: String,
    /// Release notes.
    pub changelog: String,
    /// Whether the client must update to keep running.
    pub mandatory: bool,
}

/// Accepts epoch milliseconds or an RFC 3339 string; writes epoch milliseconds.
mod flexible_timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_i64(t.timestamp_millis()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Millis(ms)) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("timestamp {ms} out of range"))),
            Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(de::Error::custom),
        }
    }
}
