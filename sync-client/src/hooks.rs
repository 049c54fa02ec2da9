//! Discovery and engagement collaborators.

use async_trait::async_trait;
use sync_types::InstanceId;

/// Asks the discovery layer for fresh information about a device.
///
/// Implementations typically re-query mDNS and feed the answer back through
/// the orchestrator's `add_device`.
#[async_trait]
pub trait DiscoveryRefresher: Send + Sync {
    /// Request fresh sync info for `id`.
    async fn refresh(&self, id: &InstanceId);
}

/// Told whenever a peer becomes CONNECTED through heartbeat or trust.
pub trait EngagementTracker: Send + Sync {
    /// Record a significant user-visible action.
    fn significant_action(&self);
}

/// Discovery refresher that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiscovery;

#[async_trait]
impl DiscoveryRefresher for NoopDiscovery {
    async fn refresh(&self, _id: &InstanceId) {}
}

/// Engagement tracker that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngagement;

impl EngagementTracker for NoopEngagement {
    fn significant_action(&self) {}
}
