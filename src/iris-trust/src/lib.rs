//! # iris-trust
//!
//! Device-trust layer for the Iris desktop client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SessionManager                         │
//! │        (encrypted store, offline-tolerant reverification)     │
//! └──────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │    AuthenticationProtocol    │  │        UpdateManager          │
//! │  (challenge → HMAC solution) │  │  (check, verified download)   │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!        │               │                       │
//!        ▼               ▼                       ▼
//! ┌──────────────┐ ┌─────────────────┐ ┌──────────────────────────┐
//! │ Hardware     │ │ Integrity       │ │      SecureChannel        │
//! │ Identity     │ │ Attestor        │ │ (signed requests, pins)   │
//! └──────────────┘ └─────────────────┘ └──────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! - **Signed transport**: every request carries an HMAC over
//!   method, path, timestamp, nonce and body digest
//! - **Hardware-bound sessions**: a session is void on any other machine
//! - **Verified updates**: nothing is launched unless its SHA-256 matches
//! - **Offline tolerant**: an unreachable server never clears a session
//! - **Posture reporting**: a live session reports its security posture
//!   and every change to it

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::missing_panics_doc)] // Panic documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod security;
pub mod session;
pub mod types;
pub mod updater;

pub use auth::{AuthOutcome, AuthState, AuthenticationProtocol};
pub use channel::{ResponseCheck, SecureChannel};
pub use config::{ResponseSignaturePolicy, TimeoutTiers, TrustConfig};
pub use error::TrustError;
pub use heartbeat::{HeartbeatService, ReportOutcome};
pub use lifecycle::{
    schedule_exit, AutoAccept, ExitHandler, ExitReason, InstallerLauncher, NeverUpdate, ProcessExit,
    SystemInstallerLauncher, UpdateDecision, UpdatePrompt,
};
pub use security::{
    CodeIntegrity, DebugChecks, IntegrityAttestor, ParsedPosture, PostureReport, PostureSignal,
    ProbeRunner, SecurityAttestation, ShellProbeRunner,
};
pub use session::{EncryptedFileStore, KeyValueStore, MemoryStore, SessionManager, VerificationOutcome};
pub use types::{Challenge, ChallengeSolution, Session, UpdateManifest, UserProfile};
pub use updater::{UpdateCheckOutcome, UpdateManager, UpdateStatus};

// Re-exported so hosts need only one dependency.
pub use iris_crypto::SecretString;
pub use iris_hardware::{HardwareFingerprint, HardwareIdentity, IdentityConfig};
