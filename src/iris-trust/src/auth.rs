//! Challenge-response client authentication.
//!
//! ```text
//! Unauthenticated ──► ChallengeRequested ──► SolutionSubmitted ──► Authenticated
//!        ▲                  │      │                  │
//!        │ (transport)      │      └─► Expired        └─► VerificationFailed { blocked }
//!        └──────────────────┴─► ChallengeFailed
//! ```
//!
//! The solution is an HMAC over the compact JSON of
//! `{challenge, hardwareId, timestamp, codeHash, version, pid}` keyed with the
//! client-authenticity secret, which is distinct from the request-signing
//! secret used by the channel.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use iris_crypto::MessageAuthenticator;
use iris_hardware::HardwareIdentity;
use tracing::{info, instrument, warn};

use crate::channel::SecureChannel;
use crate::config::TrustConfig;
use crate::error::TrustError;
use crate::security::{CodeIntegrity, IntegrityAttestor};
use crate::types::{
    AuthVerifyResponse, Challenge, ChallengeRequest, ChallengeResponse, ChallengeSolution,
    SolutionPayload,
};

/// Challenge endpoint.
pub const CHALLENGE_PATH: &str = "/auth/challenge";

/// Solution endpoint.
pub const VERIFY_PATH: &str = "/auth/verify";

/// Protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No exchange in progress.
    Unauthenticated,
    /// Waiting for the server's challenge.
    ChallengeRequested,
    /// Solution sent, waiting for the verdict.
    SolutionSubmitted,
    /// Session token issued.
    Authenticated {
        /// Token expiry, if supplied.
        expires_at: Option<DateTime<Utc>>,
    },
    /// The server did not issue a challenge.
    ChallengeFailed,
    /// The server rejected the solution.
    VerificationFailed {
        /// The server blocked this client; terminal.
        blocked: bool,
    },
    /// The challenge lapsed before a solution could be sent.
    Expired,
}

/// Result of one protocol run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Session token issued.
    Authenticated {
        /// Session token.
        session_token: String,
        /// Token expiry, if supplied.
        expires_at: Option<DateTime<Utc>>,
    },
    /// No usable challenge was issued.
    ChallengeFailed {
        /// Server or local message.
        message: Option<String>,
    },
    /// The challenge had already lapsed locally; nothing was submitted.
    Expired,
    /// The server rejected the solution.
    VerificationFailed {
        /// Machine-readable reason.
        reason: String,
        /// Human-readable message.
        message: Option<String>,
        /// Terminal: this client must not retry.
        blocked: bool,
    },
    /// Transport failure; the caller may retry.
    NetworkError {
        /// What failed.
        message: String,
    },
}

impl AuthOutcome {
    /// Whether a session token was issued.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }
}

/// Drives the challenge-response exchange.
pub struct AuthenticationProtocol {
    channel: Arc<SecureChannel>,
    identity: HardwareIdentity,
    attestor: IntegrityAttestor,
    authenticator: MessageAuthenticator,
    client_version: String,
    state: RwLock<AuthState>,
}

impl std::fmt::Debug for AuthenticationProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationProtocol")
            .field("client_version", &self.client_version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AuthenticationProtocol {
    /// Create a protocol instance.
    pub fn new(
        config: &TrustConfig,
        channel: Arc<SecureChannel>,
        identity: HardwareIdentity,
        attestor: IntegrityAttestor,
    ) -> Result<Self, TrustError> {
        Ok(Self {
            channel,
            identity,
            attestor,
            authenticator: MessageAuthenticator::new(&config.client_secret)?,
            client_version: config.client_version.clone(),
            state: RwLock::new(AuthState::Unauthenticated),
        })
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or(AuthState::Unauthenticated)
    }

    fn set_state(&self, next: AuthState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    fn is_blocked(&self) -> bool {
        matches!(self.state(), AuthState::VerificationFailed { blocked: true })
    }

    /// Build and sign a solution for `challenge`.
    pub fn solve_challenge(
        &self,
        challenge: &str,
        hardware_id: &str,
        integrity: &CodeIntegrity,
    ) -> Result<ChallengeSolution, TrustError> {
        let payload = SolutionPayload {
            challenge: challenge.to_string(),
            hardware_id: hardware_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            code_hash: integrity.combined.clone(),
            version: self.client_version.clone(),
            pid: std::process::id(),
        };
        let signed = serde_json::to_vec(&payload).map_err(iris_crypto::CryptoError::from)?;
        Ok(ChallengeSolution {
            signature: self.authenticator.tag_hex(&signed),
            payload,
            file_hashes: integrity.files.clone(),
        })
    }

    /// Run the exchange with the user's bearer token.
    ///
    /// A blocked client returns immediately without network access.
    #[instrument(skip(self, bearer))]
    pub async fn run(&self, bearer: &str) -> AuthOutcome {
        if self.is_blocked() {
            warn!("Client is blocked; refusing to authenticate");
            return AuthOutcome::VerificationFailed {
                reason: "blocked".into(),
                message: Some("This client has been blocked by the server.".into()),
                blocked: true,
            };
        }

        let (fingerprint, integrity) =
            tokio::join!(self.identity.hardware_id(), self.attestor.code_integrity_hash());
        let hardware_id = fingerprint.hash;

        // Step 1: request a challenge
        self.set_state(AuthState::ChallengeRequested);
        let request = ChallengeRequest {
            hardware_id: hardware_id.clone(),
            version: self.client_version.clone(),
            code_hash: integrity.combined.clone(),
        };
        let response: ChallengeResponse = match self
            .channel
            .post_json(CHALLENGE_PATH, &request, Some(bearer))
            .await
        {
            Ok(r) => r,
            Err(e) => return self.fail_transport(e, AuthState::ChallengeFailed),
        };

        let challenge = match (response.success, response.challenge) {
            (true, Some(value)) if !value.is_empty() => Challenge {
                value,
                expires_at: response.expires_at,
            },
            _ => {
                warn!(message = ?response.message, "Server did not issue a challenge");
                self.set_state(AuthState::ChallengeFailed);
                return AuthOutcome::ChallengeFailed {
                    message: response.message,
                };
            },
        };

        // Step 2: refuse to answer a lapsed challenge
        if challenge.is_expired_at(Utc::now()) {
            warn!(expires_at = ?challenge.expires_at, "Challenge expired before submission");
            self.set_state(AuthState::Expired);
            return AuthOutcome::Expired;
        }

        // Step 3: solve and submit
        let solution = match self.solve_challenge(&challenge.value, &hardware_id, &integrity) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to sign challenge solution");
                self.set_state(AuthState::ChallengeFailed);
                return AuthOutcome::ChallengeFailed {
                    message: Some(e.user_message()),
                };
            },
        };
        self.set_state(AuthState::SolutionSubmitted);
        let verdict: AuthVerifyResponse = match self
            .channel
            .post_json(VERIFY_PATH, &solution, Some(bearer))
            .await
        {
            Ok(v) => v,
            Err(e) => return self.fail_transport(e, AuthState::VerificationFailed { blocked: false }),
        };

        match verdict {
            AuthVerifyResponse {
                success: true,
                session_token: Some(session_token),
                expires_at,
                ..
            } => {
                info!(expires_at = ?expires_at, "Client authenticated");
                self.set_state(AuthState::Authenticated { expires_at });
                AuthOutcome::Authenticated {
                    session_token,
                    expires_at,
                }
            },
            rejected => {
                warn!(
                    reason = ?rejected.reason,
                    blocked = rejected.blocked,
                    "Challenge solution rejected"
                );
                self.set_state(AuthState::VerificationFailed {
                    blocked: rejected.blocked,
                });
                AuthOutcome::VerificationFailed {
                    reason: rejected.reason.unwrap_or_else(|| "Verification failed".into()),
                    message: rejected.message,
                    blocked: rejected.blocked,
                }
            },
        }
    }

    /// Map a channel error at either step.
    ///
    /// Connection-level failures are retryable and reset the state; anything
    /// else is a rejection at that step.
    fn fail_transport(&self, error: TrustError, rejected_state: AuthState) -> AuthOutcome {
        if error.is_retryable() {
            warn!(error = %error, "Authentication transport failure");
            self.set_state(AuthState::Unauthenticated);
            return AuthOutcome::NetworkError {
                message: error.to_string(),
            };
        }

        warn!(error = %error, "Authentication step rejected");
        let outcome = match rejected_state {
            AuthState::ChallengeFailed => AuthOutcome::ChallengeFailed {
                message: Some(error.user_message()),
            },
            _ => AuthOutcome::VerificationFailed {
                reason: "Verification failed".into(),
                message: Some(error.user_message()),
                blocked: false,
            },
        };
        self.set_state(rejected_state);
        outcome
    }
}
