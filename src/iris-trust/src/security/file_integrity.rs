//! Code integrity hashing.
//!
//! Hashes a fixed allow-list of critical files relative to the install root.
//! The server holds the expected per-file hashes for each released version.
//!
//! ## Rules
//!
//! - A missing or unreadable file is recorded as `"error"` and still folded
//!   into the combined hash, so removing a file changes the result.
//! - The combined hash is SHA-256 over the per-file values concatenated in
//!   allow-list order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Per-file value for a file that could not be hashed.
pub const UNREADABLE: &str = "error";

/// Result of hashing the critical files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIntegrity {
    /// Relative path → SHA-256 hex (or `"error"`).
    pub files: BTreeMap<String, String>,
    /// SHA-256 hex over the per-file values in allow-list order.
    pub combined: String,
}

/// Hash every file in `critical_files` under `root`.
pub async fn code_integrity_hash(root: &Path, critical_files: &[PathBuf]) -> CodeIntegrity {
    let mut files = BTreeMap::new();
    let mut combined = Sha256::new();

    for relative in critical_files {
        let value = match hash_file(&root.join(relative)).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(file = %relative.display(), error = %e, "Critical file unreadable");
                UNREADABLE.to_string()
            },
        };
        combined.update(value.as_bytes());
        files.insert(display_key(relative), value);
    }

    CodeIntegrity {
        files,
        combined: hex::encode(combined.finalize()),
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let data = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// Forward-slash relative path used as the map key on every platform.
fn display_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
