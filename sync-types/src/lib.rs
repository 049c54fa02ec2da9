//! # sync-types
//!
//! Data model and wire types for the clipmesh peer sync engine.
//!
//! This crate provides the foundational types used across all clipmesh crates:
//! - [`InstanceId`], [`TaskId`], [`PasteId`] - Identity types
//! - [`SyncInfo`], [`DeviceIdentity`], [`HostInfo`] - What discovery reports about a peer
//! - [`SyncRuntimeInfo`], [`ConnectState`], [`VersionRelation`] - Persisted per-device link state
//! - [`TaskExtraInfo`] - Retry metadata persisted alongside pull tasks
//! - [`PullChunkRequest`], [`PullIconRequest`] - Chunk wire requests
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod device;
mod error;
mod ids;
mod messages;
mod runtime;
mod task;

pub use device::{DeviceIdentity, HostInfo, Platform, SyncInfo};
pub use error::SyncError;
pub use ids::{InstanceId, PasteId, TaskId};
pub use messages::{PullChunkRequest, PullIconRequest};
pub use runtime::{ConnectState, SyncRuntimeInfo, VersionRelation};
pub use task::{
    BaseExtraInfo, ExecutionHistory, ExecutionStatus, PullExtraInfo, TaskExtraInfo, TaskType,
};
