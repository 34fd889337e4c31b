//! # iris-hardware
//!
//! Stable per-machine identity for the Iris device-trust layer.
//!
//! The hardware ID is anchored, in order of preference, on:
//!
//! | Source | Linux | Windows |
//! |--------|-------|---------|
//! | TPM 2.0 endorsement key | `/dev/tpmrm0` + `tpm2_readpublic` | `Get-Tpm` + `Get-TpmEndorsementKeyInfo` |
//! | Composite fingerprint | sysfs DMI, `/proc`, `/etc/machine-id` | CIM classes, `MachineGuid` |
//!
//! Every probe is independently timeout-bound. [`HardwareIdentity::hardware_id`]
//! never fails; it degrades to a hash over whatever components could be read.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use iris_hardware::{HardwareIdentity, IdentityConfig};
//!
//! let identity = HardwareIdentity::system(IdentityConfig::default());
//! let fingerprint = identity.hardware_id().await;
//! let tpm = identity.check_tpm_availability().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use
#![allow(clippy::missing_errors_doc)] // Error documentation not required

mod error;
mod identity;
mod probe;
mod types;

/// Platform-specific probe implementations and command helpers.
pub mod platform;

pub use error::HardwareError;
pub use identity::{composite_hash, is_placeholder_id, HardwareIdentity, IdentityConfig};
pub use platform::SystemProbe;
pub use probe::HardwareProbe;
pub use types::{
    BiosDescriptor, BoardDescriptor, CpuDescriptor, FingerprintKind, HardwareFingerprint,
    OsDescriptor, SystemDescriptor, SystemInfo,
};
