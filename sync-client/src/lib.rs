//! # sync-client
//!
//! Async peer synchronization engine for clipmesh.
//!
//! This is the crate applications embed to keep their paired devices'
//! links healthy and to pull large pastes from them.
//!
//! ## Features
//!
//! - **Per-device state machine**: one [`DeviceHandler`] per peer, driven by
//!   the pure transition function in `sync-core`
//! - **Single resolver queue**: every state write goes through one
//!   [`Resolver`] event loop, one event at a time
//! - **Adaptive polling**: capped exponential backoff per device
//! - **Resumable pulls**: chunked file transfer with a persisted completion
//!   bitmap
//! - **Pluggable collaborators**: storage, wire client, reachability
//!   checker and discovery are traits, with in-memory and mock
//!   implementations included
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_client::{EngineConfig, MemoryIdentityStore, MemoryRuntimeStore, MockPeer};
//! use sync_client::{Resolver, SyncOrchestrator};
//!
//! let peer = MockPeer::new();
//! let resolver = Resolver::new(
//!     Arc::new(MemoryRuntimeStore::new()),
//!     Arc::new(MemoryIdentityStore::new()),
//!     Arc::new(peer.clone()),
//!     Arc::new(peer),
//! );
//! let engine = SyncOrchestrator::start(resolver, EngineConfig::default());
//!
//! // Discovery found a device
//! engine.add_device(sync_info);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod hooks;
pub mod icon;
pub mod lock;
pub mod orchestrator;
pub mod progress;
pub mod pull;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod transport;

pub use config::{ConfigError, EngineConfig, HandlerConfig, PollingConfig, PullConfig};
pub use error::{PullError, ResolveError, StoreError};
pub use event::{Completion, EventSender, SyncEvent};
pub use handler::DeviceHandler;
pub use hooks::{DiscoveryRefresher, EngagementTracker, NoopDiscovery, NoopEngagement};
pub use icon::{IconPuller, PullIconTask};
pub use lock::StripedLock;
pub use orchestrator::{PeerLocator, SyncOrchestrator};
pub use progress::{ProgressEntry, PullProgress};
pub use pull::{
    resolve_names, ChunkTransferEngine, ConsumerCall, MemoryPasteConsumer, PasteConsumer,
    PullFileItem, PullFileTask, TaskOutcome, TransferSignal,
};
pub use resolver::Resolver;
pub use scheduler::PollingScheduler;
pub use store::{
    now_millis, IdentityStore, MemoryIdentityStore, MemoryRuntimeStore, MemoryTaskStore,
    RuntimeStore, TaskStore,
};
pub use token::TokenCache;
pub use transport::{ApiError, HostChecker, MockCall, MockPeer, PeerAddress, SyncApi};
