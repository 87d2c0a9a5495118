//! Error types for bus and artifact connectors

use std::path::PathBuf;

use mbus_core::{ConfigError, PathError};
use mbus_events::EventsError;
use mbus_repository::RepositoryError;

/// Bus connector errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Configuration rejected before connecting
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Notification channel failure
    #[error("notification channel: {0}")]
    Events(#[from] EventsError),

    /// Content store failure
    #[error("content store: {0}")]
    Repository(#[from] RepositoryError),

    /// Message or payload is not valid JSON
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Streamed message would exceed the configured size limit
    #[error("streamed posting of {size} bytes exceeds limit of {limit} bytes")]
    StreamedPayloadTooLarge { size: usize, limit: usize },

    /// Local file could not be read or removed
    #[error("local file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Topic or artifact identifier not usable as path segment
    #[error("invalid topic path: {0}")]
    Path(#[from] PathError),
}

/// Artifact connector errors
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Underlying bus failure
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Artifact content is not valid JSON
    #[error("artifact content is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Received delta is not valid JSON
    #[error("malformed delta: {0}")]
    MalformedDelta(#[source] serde_json::Error),

    /// Delta matched its baseline but could not be applied
    #[error("patch failed: {0}")]
    Patch(#[from] json_patch::PatchError),

    /// Artifact identifier or version not usable as path segment
    #[error("invalid artifact path: {0}")]
    Path(#[from] PathError),
}
