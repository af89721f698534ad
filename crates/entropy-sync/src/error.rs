use std::path::PathBuf;

use crate::store::StoreError;

/// Errors surfaced by the sync engine.
///
/// Expected failure modes of a single repository are reported through
/// outcome enums; this type covers the conditions that escape a step.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Timeouts, refused connections. Retried in place, then scored.
    #[error("network error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Checksum mismatch, corrupt archive, rejected signature.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Malformed replies, missing metadata keys, remote locked mid-session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Permission denied, disk full, cannot create a directory.
    #[error("local error at {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Another sync invocation holds the process-wide lock.
    #[error("another sync is already running (lock: {0})")]
    Busy(PathBuf),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Local {
            path: path.into(),
            source,
        }
    }

    /// Whether the failing step may be attempted again in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the error comes from the local machine rather than a mirror.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. } | Self::Storage(_))
    }
}
