//! Error types shared by the CA store and the leaf certificate cache.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, Error)]
pub enum CaError {
    /// Key generation failed: bad parameters or no entropy. Not retried.
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(String),
    /// Malformed input to certificate construction.
    #[error("invalid certificate input: {0}")]
    Encoding(String),
    /// On-disk trust anchor is inconsistent. Requires manual intervention.
    #[error("trust store at {} is corrupted: {reason}", path.display())]
    StoreCorrupted { path: PathBuf, reason: String },
    /// Leaf signing failed for one host. Safe to retry later.
    #[error("failed to issue leaf certificate for {hostname}: {reason}")]
    Issuance { hostname: String, reason: String },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CaError {
    pub(crate) fn corrupted(path: &Path, reason: impl Into<String>) -> Self {
        Self::StoreCorrupted {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn issuance(hostname: &str, reason: impl ToString) -> Self {
        Self::Issuance {
            hostname: hostname.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
