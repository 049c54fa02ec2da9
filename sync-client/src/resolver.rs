//! Protocol actions behind the device state machine.
//!
//! The resolver is the only writer of connect state. It consumes
//! [`SyncEvent`]s from one queue, strictly one at a time, so transitions
//! of the same or different devices never interleave. A failing or
//! panicking step is logged at the queue boundary and the loop carries on.
//!
//! Heartbeat outcome -> state:
//!
//! | heartbeat result        | new state                              |
//! |-------------------------|----------------------------------------|
//! | ok, versions equal      | CONNECTED                              |
//! | ok, versions differ     | INCOMPATIBLE                           |
//! | identity rejected       | cached key dropped, token trust/check  |
//! | decrypt/verify failure  | UNMATCHED                              |
//! | anything else           | DISCONNECTED                           |

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use sync_core::PairingToken;
use sync_types::{ConnectState, InstanceId, SyncInfo, SyncRuntimeInfo, VersionRelation};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ResolveError;
use crate::event::SyncEvent;
use crate::hooks::{DiscoveryRefresher, EngagementTracker, NoopDiscovery, NoopEngagement};
use crate::store::{IdentityStore, RuntimeStore};
use crate::token::TokenCache;
use crate::transport::{ApiError, HostChecker, PeerAddress, SyncApi};

/// Executes protocol actions and writes the resulting connect state.
pub struct Resolver {
    store: Arc<dyn RuntimeStore>,
    identities: Arc<dyn IdentityStore>,
    api: Arc<dyn SyncApi>,
    checker: Arc<dyn HostChecker>,
    tokens: Arc<TokenCache>,
    discovery: Arc<dyn DiscoveryRefresher>,
    engagement: Arc<dyn EngagementTracker>,
}

impl Resolver {
    /// Create a resolver with no-op discovery and engagement hooks.
    pub fn new(
        store: Arc<dyn RuntimeStore>,
        identities: Arc<dyn IdentityStore>,
        api: Arc<dyn SyncApi>,
        checker: Arc<dyn HostChecker>,
    ) -> Self {
        Self {
            store,
            identities,
            api,
            checker,
            tokens: Arc::new(TokenCache::new()),
            discovery: Arc::new(NoopDiscovery),
            engagement: Arc::new(NoopEngagement),
        }
    }

    /// Use `discovery` for refresh requests.
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryRefresher>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Signal `engagement` when a peer becomes CONNECTED.
    pub fn with_engagement(mut self, engagement: Arc<dyn EngagementTracker>) -> Self {
        self.engagement = engagement;
        self
    }

    /// Share an existing token cache.
    pub fn with_tokens(mut self, tokens: Arc<TokenCache>) -> Self {
        self.tokens = tokens;
        self
    }

    /// The record store this resolver writes to.
    pub fn store(&self) -> &Arc<dyn RuntimeStore> {
        &self.store
    }

    /// The pairing token cache.
    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    /// Consume `events` one at a time until every sender is gone.
    pub fn spawn_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SyncEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let name = event.name();
                let id = event.instance_id().clone();
                match AssertUnwindSafe(self.dispatch(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("{} for {} failed: {}", name, id, e),
                    Err(_) => error!("{} for {} panicked", name, id),
                }
            }
            debug!("resolver event loop stopped");
        })
    }

    /// Execute one event and report through its completion.
    pub async fn dispatch(&self, event: SyncEvent) -> Result<(), ResolveError> {
        match event {
            SyncEvent::ResolveDisconnected { info, done } => {
                let result = self.resolve_disconnected(&info).await;
                done.complete(result.as_ref().ok().copied().flatten());
                result.map(|_| ())
            }
            SyncEvent::ResolveConnecting { info, done } => {
                let result = self.resolve_connecting(&info).await;
                done.complete(result.as_ref().ok().copied().flatten());
                result.map(|_| ())
            }
            SyncEvent::ResolveConnection { info, done } => {
                let result = self.resolve_connection(&info).await;
                done.complete(result.as_ref().ok().copied().flatten());
                result.map(|_| ())
            }
            SyncEvent::ForceResolveConnection { info, done } => {
                let result = self.force_resolve_connection(&info).await;
                done.complete(result.as_ref().ok().copied().flatten());
                result.map(|_| ())
            }
            SyncEvent::TrustByToken { info, token, done } => {
                let result = self.trust_by_token(&info, token).await;
                done.complete(*result.as_ref().unwrap_or(&false));
                result.map(|_| ())
            }
            SyncEvent::UpdateAllowSend { info, allow, done } => {
                let result = self.store.update_allow_send(info.instance_id(), allow).await;
                done.complete(());
                result.map(|_| ()).map_err(Into::into)
            }
            SyncEvent::UpdateAllowReceive { info, allow, done } => {
                let result = self
                    .store
                    .update_allow_receive(info.instance_id(), allow)
                    .await;
                done.complete(());
                result.map(|_| ()).map_err(Into::into)
            }
            SyncEvent::UpdateNoteName {
                info,
                note_name,
                done,
            } => {
                let result = self
                    .store
                    .update_note_name(info.instance_id(), note_name)
                    .await;
                done.complete(());
                result.map(|_| ()).map_err(Into::into)
            }
            SyncEvent::ShowToken { info, done } => {
                let result = self.show_token(&info).await;
                done.complete(());
                result
            }
            SyncEvent::NotifyExit { info, done } => {
                self.notify_exit(&info).await;
                done.complete(());
                Ok(())
            }
            SyncEvent::MarkExit { info, done } => {
                let result = self.mark_exit(&info).await;
                done.complete(());
                result
            }
            SyncEvent::RemoveDevice { info, done } => {
                let result = self.remove_device(&info).await;
                done.complete(());
                result
            }
            SyncEvent::RefreshSyncInfo { instance_id } => {
                self.discovery.refresh(&instance_id).await;
                Ok(())
            }
            SyncEvent::UpdateSyncInfo { sync_info } => self.update_sync_info(sync_info).await,
        }
    }

    /// Latest stored record; `None` when the device was removed meanwhile.
    async fn latest(&self, info: &SyncRuntimeInfo) -> Result<Option<SyncRuntimeInfo>, ResolveError> {
        let latest = self.store.get(info.instance_id()).await?;
        if latest.is_none() {
            debug!("{} no longer stored, skipping", info.instance_id());
        }
        Ok(latest)
    }

    async fn write_state(
        &self,
        info: &SyncRuntimeInfo,
        state: ConnectState,
        host: Option<String>,
    ) -> Result<(), ResolveError> {
        debug!(
            "{}: {} -> {} (host {:?})",
            info.instance_id(),
            info.connect_state,
            state,
            host
        );
        self.store
            .update_connect_info(info.instance_id(), state, host)
            .await?;
        Ok(())
    }

    /// Look for a reachable host among the candidates.
    pub async fn resolve_disconnected(
        &self,
        info: &SyncRuntimeInfo,
    ) -> Result<Option<VersionRelation>, ResolveError> {
        let Some(info) = self.latest(info).await? else {
            return Ok(None);
        };
        self.resolve_disconnected_record(&info).await
    }

    async fn resolve_disconnected_record(
        &self,
        info: &SyncRuntimeInfo,
    ) -> Result<Option<VersionRelation>, ResolveError> {
        let found = self
            .checker
            .best_reachable_host(info.instance_id(), &info.host_info_list, info.port)
            .await;

        match found {
            Some((host, relation)) if relation.is_equal() => {
                self.write_state(info, ConnectState::Connecting, Some(host.host_address))
                    .await?;
                Ok(Some(relation))
            }
            Some((host, relation)) => {
                self.write_state(info, ConnectState::Incompatible, Some(host.host_address))
                    .await?;
                Ok(Some(relation))
            }
            None => {
                self.write_state(info, ConnectState::Disconnected, None).await?;
                Ok(None)
            }
        }
    }

    /// Verify the bound host by heartbeat, token trust, or version check.
    pub async fn resolve_connecting(
        &self,
        info: &SyncRuntimeInfo,
    ) -> Result<Option<VersionRelation>, ResolveError> {
        let Some(info) = self.latest(info).await? else {
            return Ok(None);
        };
        self.resolve_connecting_record(&info).await
    }

    async fn resolve_connecting_record(
        &self,
        info: &SyncRuntimeInfo,
    ) -> Result<Option<VersionRelation>, ResolveError> {
        let Some(host) = info.connect_host_address.clone() else {
            self.write_state(info, ConnectState::Disconnected, None).await?;
            return Ok(None);
        };
        let id = info.instance_id();
        let target = PeerAddress::new(id.clone(), host.clone(), info.port);

        if self.identities.exists_cached_public_key(id).await? {
            match self.api.heartbeat(&target).await {
                Ok(relation) if relation.is_equal() => {
                    self.write_state(info, ConnectState::Connected, Some(host))
                        .await?;
                    self.engagement.significant_action();
                    return Ok(Some(relation));
                }
                Ok(relation) => {
                    self.write_state(info, ConnectState::Incompatible, Some(host))
                        .await?;
                    return Ok(Some(relation));
                }
                Err(ApiError::IdentityRejected) => {
                    info!("{} no longer recognizes us, dropping cached identity", id);
                    self.identities.delete_cached_public_key(id).await?;
                }
                Err(ApiError::DecryptFailed) => {
                    warn!("{} failed verification, re-pairing required", id);
                    self.write_state(info, ConnectState::Unmatched, None).await?;
                    return Ok(None);
                }
                Err(e) => {
                    debug!("heartbeat to {} failed: {}", target, e);
                    self.write_state(info, ConnectState::Disconnected, None)
                        .await?;
                    return Ok(None);
                }
            }
        }

        self.trust_or_check(info, &target).await
    }

    async fn trust_or_check(
        &self,
        info: &SyncRuntimeInfo,
        target: &PeerAddress,
    ) -> Result<Option<VersionRelation>, ResolveError> {
        if let Some(token) = self.tokens.take(info.instance_id()) {
            match self.api.trust(target, token).await {
                Ok(key) => {
                    self.identities
                        .save_public_key(info.instance_id(), key)
                        .await?;
                    self.write_state(info, ConnectState::Connected, Some(target.host.clone()))
                        .await?;
                    self.engagement.significant_action();
                    return Ok(Some(VersionRelation::EqualTo));
                }
                Err(e) => debug!("token trust with {} failed: {}", target, e),
            }
        }

        match self
            .checker
            .check(info.instance_id(), &target.host, target.port)
            .await
        {
            Some(relation) if relation.is_equal() => {
                self.write_state(info, ConnectState::Unverified, Some(target.host.clone()))
                    .await?;
                Ok(Some(relation))
            }
            Some(relation) => {
                self.write_state(info, ConnectState::Incompatible, Some(target.host.clone()))
                    .await?;
                Ok(Some(relation))
            }
            None => {
                self.write_state(info, ConnectState::Disconnected, None).await?;
                Ok(None)
            }
        }
    }

    /// Resolve by the record's own state.
    pub async fn resolve_connection(
        &self,
        info: &SyncRuntimeInfo,
    ) -> Result<Option<VersionRelation>, ResolveError> {
        let Some(info) = self.latest(info).await? else {
            return Ok(None);
        };
        let from_scratch = matches!(
            info.connect_state,
            ConnectState::Disconnected | ConnectState::Incompatible
        ) || info.connect_host_address.is_none();

        if from_scratch {
            self.resolve_disconnected_record(&info).await
        } else {
            self.resolve_connecting_record(&info).await
        }
    }

    /// Refresh discovery info first, then resolve.
    pub async fn force_resolve_connection(
        &self,
        info: &SyncRuntimeInfo,
    ) -> Result<Option<VersionRelation>, ResolveError> {
        self.discovery.refresh(info.instance_id()).await;
        self.resolve_connection(info).await
    }

    /// Submit a token. Only effective while UNVERIFIED; any other state is
    /// left untouched.
    pub async fn trust_by_token(
        &self,
        info: &SyncRuntimeInfo,
        token: PairingToken,
    ) -> Result<bool, ResolveError> {
        let Some(info) = self.latest(info).await? else {
            return Ok(false);
        };
        if info.connect_state != ConnectState::Unverified {
            debug!(
                "ignoring token for {} in state {}",
                info.instance_id(),
                info.connect_state
            );
            return Ok(false);
        }
        let Some(host) = info.connect_host_address.clone() else {
            return Ok(false);
        };

        let target = PeerAddress::new(info.instance_id().clone(), host.clone(), info.port);
        match self.api.trust(&target, token).await {
            Ok(key) => {
                self.identities
                    .save_public_key(info.instance_id(), key)
                    .await?;
                self.write_state(&info, ConnectState::Connected, Some(host))
                    .await?;
                self.engagement.significant_action();
                Ok(true)
            }
            Err(e) => {
                debug!("trust with {} rejected: {}", target, e);
                Ok(false)
            }
        }
    }

    fn target_of(info: &SyncRuntimeInfo) -> Option<PeerAddress> {
        info.connect_host_address
            .as_ref()
            .map(|host| PeerAddress::new(info.instance_id().clone(), host.clone(), info.port))
    }

    /// Ask the peer to display its pairing token.
    pub async fn show_token(&self, info: &SyncRuntimeInfo) -> Result<(), ResolveError> {
        let info = self.latest(info).await?.unwrap_or_else(|| info.clone());
        let target =
            Self::target_of(&info).ok_or_else(|| ResolveError::NoHost(info.instance_id().clone()))?;
        self.api.show_token(&target).await?;
        Ok(())
    }

    /// Best-effort exit notification. Failures are logged only.
    pub async fn notify_exit(&self, info: &SyncRuntimeInfo) {
        let Some(target) = Self::target_of(info) else {
            return;
        };
        if let Err(e) = self.api.notify_exit(&target).await {
            warn!("exit notification to {} failed: {}", target, e);
        }
    }

    /// The peer is exiting: force DISCONNECTED locally.
    pub async fn mark_exit(&self, info: &SyncRuntimeInfo) -> Result<(), ResolveError> {
        self.write_state(info, ConnectState::Disconnected, None).await
    }

    /// Drop the cached identity and the record, then tell the peer.
    ///
    /// Local cleanup happens first; the notification is best effort.
    pub async fn remove_device(&self, info: &SyncRuntimeInfo) -> Result<(), ResolveError> {
        let id = info.instance_id();
        let target = self
            .store
            .get(id)
            .await?
            .as_ref()
            .and_then(Self::target_of)
            .or_else(|| Self::target_of(info));

        self.identities.delete_cached_public_key(id).await?;
        self.store.delete(id).await?;
        self.tokens.take(id);
        info!("removed device {}", id);

        if let Some(target) = target {
            if let Err(e) = self.api.notify_remove(&target).await {
                warn!("remove notification to {} failed: {}", target, e);
            }
        }
        Ok(())
    }

    /// Merge a discovery announcement into the stored record.
    pub async fn update_sync_info(&self, sync_info: SyncInfo) -> Result<(), ResolveError> {
        let id: InstanceId = sync_info.instance_id().clone();
        let record = self.store.insert_or_update(sync_info).await?;
        debug!("sync info for {} stored ({})", id, record.connect_state);
        Ok(())
    }
}
