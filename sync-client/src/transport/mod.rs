//! Wire client abstraction for clipmesh.
//!
//! The engine never talks to the network directly. It goes through two
//! collaborator traits:
//! - [`SyncApi`] for authenticated calls to one peer (heartbeat, trust,
//!   chunk pulls, exit/remove notifications)
//! - [`HostChecker`] for unauthenticated reachability and version checks
//!
//! Implementations own encryption, signing and timeouts. Every call must
//! resolve to a terminal result; the resolver's single consumer awaits them.
//!
//! # Example
//!
//! ```ignore
//! let peer = MockPeer::new();
//! peer.set_reachable(&id, &["10.0.0.5"], VersionRelation::EqualTo);
//! let relation = peer.heartbeat(&PeerAddress::new(id, "10.0.0.5", 13129)).await?;
//! ```

mod mock;

pub use mock::{MockCall, MockPeer};

use async_trait::async_trait;
use std::fmt;
use sync_core::PairingToken;
use sync_types::{HostInfo, InstanceId, PullChunkRequest, PullIconRequest, VersionRelation};
use thiserror::Error;

/// Numeric error codes a peer may answer with.
///
/// This table is part of the protocol; the resolver's state mapping depends
/// on it.
pub mod error_code {
    /// The peer does not recognize our identity (our cached key is stale).
    pub const IDENTITY_NOT_RECOGNIZED: u32 = 2001;
    /// The peer could not decrypt or verify our request.
    pub const DECRYPT_FAILED: u32 = 2002;
    /// The pairing token was wrong or expired.
    pub const TOKEN_INVALID: u32 = 2003;
    /// The requested paste or task is unknown to the peer.
    pub const NOT_FOUND: u32 = 4004;
    /// Requested chunk index is outside the paste's files index.
    pub const CHUNK_OUT_OF_RANGE: u32 = 4005;
}

/// Failures of a wire call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The host could not be reached.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The call timed out.
    #[error("request timed out")]
    Timeout,

    /// The peer does not recognize our identity.
    #[error("identity rejected by peer")]
    IdentityRejected,

    /// Decryption or signature verification failed.
    #[error("decrypt or verify failed")]
    DecryptFailed,

    /// Bad or expired pairing token.
    #[error("unauthorized")]
    Unauthorized,

    /// Any other error reported by the peer.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Error code from the peer.
        code: u32,
        /// Human-readable message.
        message: String,
    },
}

impl ApiError {
    /// Classify an error code returned by a peer.
    pub fn from_remote_code(code: u32, message: impl Into<String>) -> Self {
        match code {
            error_code::IDENTITY_NOT_RECOGNIZED => Self::IdentityRejected,
            error_code::DECRYPT_FAILED => Self::DecryptFailed,
            error_code::TOKEN_INVALID => Self::Unauthorized,
            code => Self::Remote {
                code,
                message: message.into(),
            },
        }
    }
}

/// Where to send a call: the peer plus the host the link is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    /// Which peer.
    pub instance_id: InstanceId,
    /// Bound host address.
    pub host: String,
    /// Sync server port.
    pub port: u16,
}

impl PeerAddress {
    /// Create a peer address.
    pub fn new(instance_id: InstanceId, host: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.instance_id, self.host, self.port)
    }
}

/// Authenticated calls to one peer.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Liveness plus version check. Requires a cached identity for the peer.
    async fn heartbeat(&self, target: &PeerAddress) -> Result<VersionRelation, ApiError>;

    /// Present a pairing token to establish trust. Returns the peer's
    /// public key on success.
    async fn trust(&self, target: &PeerAddress, token: PairingToken)
        -> Result<Vec<u8>, ApiError>;

    /// Ask the peer to display its pairing token.
    async fn show_token(&self, target: &PeerAddress) -> Result<(), ApiError>;

    /// Tell the peer we are shutting down.
    async fn notify_exit(&self, target: &PeerAddress) -> Result<(), ApiError>;

    /// Tell the peer we removed it.
    async fn notify_remove(&self, target: &PeerAddress) -> Result<(), ApiError>;

    /// Fetch the raw bytes of one chunk.
    async fn pull_file_chunk(
        &self,
        target: &PeerAddress,
        request: &PullChunkRequest,
    ) -> Result<Vec<u8>, ApiError>;

    /// Fetch an application icon.
    async fn pull_icon(
        &self,
        target: &PeerAddress,
        request: &PullIconRequest,
    ) -> Result<Vec<u8>, ApiError>;
}

/// Unauthenticated reachability checks.
#[async_trait]
pub trait HostChecker: Send + Sync {
    /// Find the best reachable host among `candidates` and the version
    /// relation it reports. `None` when no candidate answers.
    async fn best_reachable_host(
        &self,
        instance_id: &InstanceId,
        candidates: &[HostInfo],
        port: u16,
    ) -> Option<(HostInfo, VersionRelation)>;

    /// Check one host. `None` when it does not answer.
    async fn check(&self, instance_id: &InstanceId, host: &str, port: u16)
        -> Option<VersionRelation>;
}
