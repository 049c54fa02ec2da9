//! One-shot pairing token cache.

use dashmap::DashMap;
use sync_core::PairingToken;
use sync_types::InstanceId;

/// Pairing tokens waiting to be presented to a peer.
///
/// Reading a token removes it: each token is submitted at most once.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: DashMap<InstanceId, PairingToken>,
}

impl TokenCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token for a peer, replacing any earlier one.
    pub fn set(&self, id: InstanceId, token: PairingToken) {
        self.tokens.insert(id, token);
    }

    /// Take the peer's token, if any.
    pub fn take(&self, id: &InstanceId) -> Option<PairingToken> {
        self.tokens.remove(id).map(|(_, token)| token)
    }

    /// Whether a token is waiting for the peer.
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.tokens.contains_key(id)
    }
}
