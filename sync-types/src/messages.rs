//! Chunk transfer requests sent to a peer.
//!
//! The response to either request is the raw bytes of the requested range,
//! so only the requests have a wire form.

use serde::{Deserialize, Serialize};

use crate::{PasteId, SyncError, TaskId};

/// Request for one chunk of a paste's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullChunkRequest {
    /// Local pull task the chunk belongs to.
    pub task_id: TaskId,
    /// Paste whose files are being pulled (how the serving peer finds them).
    pub paste_id: PasteId,
    /// Index of the chunk in the paste's files index.
    pub chunk_index: u32,
}

impl PullChunkRequest {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// Request for an application icon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullIconRequest {
    /// Application the icon belongs to (bundle id or executable name).
    pub source: String,
}

impl PullIconRequest {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}
