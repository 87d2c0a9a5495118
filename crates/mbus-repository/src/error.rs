//! Error types for the content store

use std::path::PathBuf;

use mbus_core::PathError;

/// Content store errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Server unreachable or login refused
    #[error("connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },

    /// Remote operation failed on an open session
    #[error("{op} {path} failed: {reason}")]
    Remote {
        op: &'static str,
        path: String,
        reason: String,
    },

    /// Local scratch file could not be read or written
    #[error("local file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Pointer record missing fields or with unusable values
    #[error("invalid repository event: {0}")]
    InvalidEvent(String),

    /// Pointer record is not valid JSON
    #[error("repository event encoding: {0}")]
    Json(#[from] serde_json::Error),

    /// Session used after close
    #[error("session already closed")]
    SessionClosed,

    /// Environment or agent not usable as path segment
    #[error("invalid remote path: {0}")]
    Path(#[from] PathError),
}

impl RepositoryError {
    pub(crate) fn remote(op: &'static str, path: &str, reason: impl ToString) -> Self {
        Self::Remote {
            op,
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
