//! Error types for clipmesh.

use thiserror::Error;

/// Errors that can occur while encoding or decoding clipmesh data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON encoding or decoding of persisted metadata failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Unsupported wire version
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
}
