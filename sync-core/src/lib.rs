//! # sync-core
//!
//! Pure logic for the clipmesh sync engine (no I/O, instant tests).
//!
//! Everything here takes input and produces output without side effects:
//! - [`transition`] decides which resolve action a record change calls for
//! - [`BackoffPolicy`] computes poll delays from a failure count
//! - [`FilesIndex`] partitions a paste's files into fixed-size chunks
//! - [`ChunkBitmap`] tracks which chunks of a pull are done
//! - [`SyncInfoPayload`] encodes a peer's sync info plus a pairing token
//!
//! The actual I/O (timers, network, disk) is performed by `sync-client`,
//! which interprets the actions and values produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod bitmap;
pub mod files_index;
pub mod pairing;
pub mod transition;

pub use backoff::BackoffPolicy;
pub use bitmap::ChunkBitmap;
pub use files_index::{FilesChunk, FilesIndex, IndexedFile, DEFAULT_CHUNK_SIZE};
pub use pairing::{PairingError, PairingToken, SyncInfoPayload, PAYLOAD_VERSION};
pub use transition::{initial_action, resolve_way_for, transition, Action, ResolveWay};
