//! Error types for the sync engine.

use sync_types::{InstanceId, SyncError};
use thiserror::Error;

use crate::transport::ApiError;

/// Persistence collaborator errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Stored data could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),

    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failure of one resolver step.
///
/// These are logged by the resolver's event loop and never reach the
/// handler that emitted the event.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Reading or writing a record failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A wire call the step depends on failed.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// The step needs a bound host and the record has none.
    #[error("no connect host for {0}")]
    NoHost(InstanceId),
}

/// Failure of one chunked pull attempt.
#[derive(Debug, Error)]
pub enum PullError {
    /// The orchestrator tracks no handler for the remote device.
    #[error("no sync handler for {0}")]
    NoSyncHandler(InstanceId),

    /// The handler could not produce a live address in time.
    #[error("connect address unavailable for {0}")]
    AddressUnavailable(InstanceId),

    /// A chunk index does not exist in the files index.
    #[error("chunk index {index} out of range ({count} chunks)")]
    ChunkIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Chunks in the index.
        count: usize,
    },

    /// The persisted bitmap does not match the rebuilt files index.
    #[error("chunk count mismatch: persisted {persisted}, rebuilt {rebuilt}")]
    ChunkCountMismatch {
        /// Chunks recorded by the previous attempt.
        persisted: usize,
        /// Chunks in the freshly built index.
        rebuilt: usize,
    },

    /// The peer answered with the wrong number of bytes.
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        /// Chunk index.
        index: u32,
        /// Expected length.
        expected: u64,
        /// Received length.
        actual: u64,
    },

    /// Some chunks of the attempt failed.
    #[error("{} chunk(s) failed, first: {first}", .failed.len())]
    ChunksFailed {
        /// Indices of the failed chunks, ascending.
        failed: Vec<u32>,
        /// Description of the first failure.
        first: String,
    },

    /// A wire call failed.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading or writing task metadata failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The attempt was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl PullError {
    /// Whether the failure consumes one attempt of the retry budget (as
    /// opposed to being fatal right away).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ChunkCountMismatch { .. } | Self::ChunkIndexOutOfRange { .. } | Self::Cancelled
        )
    }
}
