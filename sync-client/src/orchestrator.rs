//! Device registry and the single resolver queue.
//!
//! The orchestrator keeps one [`DeviceHandler`] per persisted record,
//! reconciled against the store's live record stream, and routes every
//! handler's events into the one resolver event loop.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use sync_core::{PairingToken, SyncInfoPayload};
use sync_types::{InstanceId, SyncInfo, SyncRuntimeInfo};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::PullError;
use crate::event::{EventSender, SyncEvent};
use crate::handler::DeviceHandler;
use crate::resolver::Resolver;
use crate::store::RuntimeStore;
use crate::token::TokenCache;
use crate::transport::PeerAddress;

/// Finds a live address for a device.
#[async_trait]
pub trait PeerLocator: Send + Sync {
    /// Address of `id`'s bound host.
    ///
    /// # Errors
    ///
    /// [`PullError::NoSyncHandler`] when the device is not tracked,
    /// [`PullError::AddressUnavailable`] when no host is bound after the
    /// bounded wait.
    async fn locate(&self, id: &InstanceId) -> Result<PeerAddress, PullError>;
}

/// Owns every device handler and the resolver loop.
pub struct SyncOrchestrator {
    handlers: DashMap<InstanceId, Arc<DeviceHandler>>,
    ignore_verify: DashSet<InstanceId>,
    events: EventSender,
    store: Arc<dyn RuntimeStore>,
    tokens: Arc<TokenCache>,
    config: EngineConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Start the engine: one handler per stored record, the reconcile loop
    /// and the resolver loop.
    pub fn start(resolver: Resolver, config: EngineConfig) -> Arc<Self> {
        let (events, rx) = EventSender::channel();
        let store = Arc::clone(resolver.store());
        let tokens = Arc::clone(resolver.tokens());
        let mut records = store.subscribe();

        let orchestrator = Arc::new(Self {
            handlers: DashMap::new(),
            ignore_verify: DashSet::new(),
            events,
            store,
            tokens,
            config,
            tasks: Mutex::new(Vec::new()),
        });

        let initial = records.borrow_and_update().clone();
        orchestrator.reconcile(&initial);

        let resolver_task = Arc::new(resolver).spawn_event_loop(rx);
        let weak = Arc::downgrade(&orchestrator);
        let reconcile_task = tokio::spawn(async move {
            while records.changed().await.is_ok() {
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                let snapshot = records.borrow_and_update().clone();
                orchestrator.reconcile(&snapshot);
            }
            debug!("reconcile loop stopped");
        });

        orchestrator
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([resolver_task, reconcile_task]);

        info!("sync engine started with {} device(s)", initial.len());
        orchestrator
    }

    /// Bring the handler map in line with `records`.
    fn reconcile(&self, records: &[SyncRuntimeInfo]) {
        let live: HashSet<&InstanceId> = records.iter().map(|r| r.instance_id()).collect();

        for record in records {
            // Clone out of the map before inserting; never insert while a
            // shard reference is held.
            let existing = self
                .handlers
                .get(record.instance_id())
                .map(|entry| Arc::clone(entry.value()));
            match existing {
                Some(handler) => handler.update(record.clone()),
                None => {
                    let handler =
                        DeviceHandler::spawn(record.clone(), self.events.clone(), &self.config);
                    self.handlers.insert(record.instance_id().clone(), handler);
                }
            }
        }

        self.handlers.retain(|id, handler| {
            let keep = live.contains(id);
            if !keep {
                handler.dispose();
            }
            keep
        });
        self.ignore_verify.retain(|id| live.contains(id));
    }

    /// Handler for `id`, if tracked.
    pub fn handler(&self, id: &InstanceId) -> Option<Arc<DeviceHandler>> {
        self.handlers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Tracked device ids, sorted.
    pub fn device_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.handlers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Current records of every tracked device.
    pub async fn records(&self) -> Vec<SyncRuntimeInfo> {
        match self.store.get_all().await {
            Ok(records) => records,
            Err(e) => {
                error!("failed to read device records: {}", e);
                Vec::new()
            }
        }
    }

    /// Discovery saw a device: merge its announcement into the store.
    pub fn add_device(&self, sync_info: SyncInfo) {
        self.events.send(SyncEvent::UpdateSyncInfo { sync_info });
    }

    /// Discovery lost a device's service. Re-checks reachability; the
    /// record is kept.
    pub fn remove_device(&self, sync_info: &SyncInfo) {
        if let Some(handler) = self.handler(sync_info.instance_id()) {
            handler.resolve();
        }
    }

    /// Pair from a scanned invitation: cache its token, then add the device.
    pub fn pair(&self, payload: SyncInfoPayload) {
        let id = payload.sync_info.instance_id().clone();
        self.tokens.set(id, payload.token);
        self.add_device(payload.sync_info);
    }

    /// Unpair: drop the device's identity and record and tell the peer.
    ///
    /// Returns `false` when the device is not tracked.
    pub async fn unpair(&self, id: &InstanceId) -> bool {
        let Some(handler) = self.handler(id) else {
            return false;
        };
        handler.remove_device().await;
        true
    }

    /// Suppress verification prompts for `id`.
    pub fn ignore_verify(&self, id: &InstanceId) {
        self.ignore_verify.insert(id.clone());
    }

    /// Allow verification prompts for `id` again.
    pub fn to_verify(&self, id: &InstanceId) {
        self.ignore_verify.remove(id);
    }

    /// Whether prompts for `id` are suppressed.
    pub fn is_verify_ignored(&self, id: &InstanceId) -> bool {
        self.ignore_verify.contains(id)
    }

    /// Change whether clipboard changes are pushed to `id`.
    pub async fn update_allow_send(&self, id: &InstanceId, allow: bool) -> bool {
        match self.handler(id) {
            Some(handler) => {
                handler.update_allow_send(allow).await;
                true
            }
            None => false,
        }
    }

    /// Change whether clipboard changes from `id` are accepted.
    pub async fn update_allow_receive(&self, id: &InstanceId, allow: bool) -> bool {
        match self.handler(id) {
            Some(handler) => {
                handler.update_allow_receive(allow).await;
                true
            }
            None => false,
        }
    }

    /// Set or clear the note name of `id`.
    pub async fn update_note_name(&self, id: &InstanceId, note_name: Option<String>) -> bool {
        match self.handler(id) {
            Some(handler) => {
                handler.update_note_name(note_name).await;
                true
            }
            None => false,
        }
    }

    /// Submit a pairing token for an UNVERIFIED device.
    pub async fn trust_by_token(&self, id: &InstanceId, token: PairingToken) -> bool {
        match self.handler(id) {
            Some(handler) => handler.trust_by_token(token).await,
            None => false,
        }
    }

    /// Ask `id` to display its pairing token.
    pub async fn show_token(&self, id: &InstanceId) {
        if let Some(handler) = self.handler(id) {
            handler.show_token().await;
        }
    }

    /// `id` announced its exit.
    pub async fn mark_exit(&self, id: &InstanceId) {
        if let Some(handler) = self.handler(id) {
            handler.mark_exit().await;
        }
    }

    /// Force-resolve the devices in `ids` (all when empty), then call
    /// `callback` once, whatever the individual outcomes.
    pub async fn refresh<F>(&self, ids: &[InstanceId], callback: F)
    where
        F: FnOnce(),
    {
        let targets: Vec<Arc<DeviceHandler>> = self
            .handlers
            .iter()
            .filter(|entry| ids.is_empty() || ids.contains(entry.key()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|handler| AssertUnwindSafe(handler.force_resolve()).catch_unwind()),
        )
        .await;

        for (handler, result) in targets.iter().zip(results) {
            match result {
                Ok(relation) => debug!("refreshed {}: {:?}", handler.instance_id(), relation),
                Err(_) => error!("refresh of {} panicked", handler.instance_id()),
            }
        }
        callback();
    }

    /// Tell every peer we are exiting.
    pub async fn notify_exit(&self) {
        let targets: Vec<Arc<DeviceHandler>> = self
            .handlers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        join_all(targets.iter().map(|handler| handler.notify_exit())).await;
    }

    /// Dispose every handler and stop the background loops.
    pub fn shutdown(&self) {
        for entry in self.handlers.iter() {
            entry.value().dispose();
        }
        self.handlers.clear();
        self.ignore_verify.clear();
        let tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        debug!("sync engine stopped");
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[async_trait]
impl PeerLocator for SyncOrchestrator {
    async fn locate(&self, id: &InstanceId) -> Result<PeerAddress, PullError> {
        let handler = self
            .handler(id)
            .ok_or_else(|| PullError::NoSyncHandler(id.clone()))?;
        handler
            .peer_address()
            .await
            .ok_or_else(|| PullError::AddressUnavailable(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryIdentityStore, MemoryRuntimeStore};
    use crate::transport::{MockCall, MockPeer};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use sync_types::{ConnectState, DeviceIdentity, HostInfo, Platform, VersionRelation};

    struct Engine {
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<MemoryRuntimeStore>,
        identities: Arc<MemoryIdentityStore>,
        peer: MockPeer,
    }

    fn sync_info(id: &str, host: &str) -> SyncInfo {
        SyncInfo {
            identity: DeviceIdentity {
                instance_id: InstanceId::new(id),
                device_id: format!("hw-{}", id),
                device_name: id.to_uppercase(),
                platform: Platform {
                    name: "Linux".into(),
                    arch: "x86_64".into(),
                    bit_mode: 64,
                    version: "6.8".into(),
                },
            },
            app_version: "1.0.0".into(),
            host_info_list: vec![HostInfo::new(host, 24)],
            port: 13129,
        }
    }

    fn engine(records: Vec<SyncInfo>) -> Engine {
        let store = Arc::new(MemoryRuntimeStore::with_records(
            records
                .into_iter()
                .map(|info| SyncRuntimeInfo::from_sync_info(info, 0))
                .collect(),
        ));
        let identities = Arc::new(MemoryIdentityStore::new());
        let peer = MockPeer::new();
        let resolver = Resolver::new(
            store.clone(),
            identities.clone(),
            Arc::new(peer.clone()),
            Arc::new(peer.clone()),
        );
        let orchestrator = SyncOrchestrator::start(resolver, EngineConfig::default());
        Engine {
            orchestrator,
            store,
            identities,
            peer,
        }
    }

    impl Engine {
        async fn state(&self, id: &InstanceId) -> Option<ConnectState> {
            self.store
                .get(id)
                .await
                .unwrap()
                .map(|record| record.connect_state)
        }

        async fn wait_for_state(&self, id: &InstanceId, state: ConnectState) {
            for _ in 0..200 {
                if self.state(id).await == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("{} never reached {}: {:?}", id, state, self.state(id).await);
        }

        async fn wait_until(&self, mut condition: impl FnMut(&SyncOrchestrator) -> bool) {
            for _ in 0..200 {
                if condition(&self.orchestrator) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("condition never held");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trusted_reachable_device_converges_to_connected() {
        let id = InstanceId::new("a");
        let engine = engine(vec![sync_info("a", "10.0.0.2")]);
        engine
            .peer
            .set_reachable(&id, &["10.0.0.2"], VersionRelation::EqualTo);
        engine.identities.cache_public_key(&id);

        assert_eq!(engine.orchestrator.device_ids(), vec![id.clone()]);
        engine.wait_for_state(&id, ConnectState::Connected).await;

        let record = engine.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.connect_host_address.as_deref(), Some("10.0.0.2"));
        let address = engine.orchestrator.locate(&id).await.unwrap();
        assert_eq!(address.to_string(), "a@10.0.0.2:13129");
    }

    #[tokio::test(start_paused = true)]
    async fn version_mismatch_settles_incompatible() {
        let id = InstanceId::new("b");
        let engine = engine(vec![sync_info("b", "10.0.0.3")]);
        engine
            .peer
            .set_reachable(&id, &["10.0.0.3"], VersionRelation::Older);
        engine.identities.cache_public_key(&id);

        engine.wait_for_state(&id, ConnectState::Incompatible).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(engine.state(&id).await, Some(ConnectState::Incompatible));
    }

    #[tokio::test(start_paused = true)]
    async fn add_device_creates_record_and_handler() {
        let engine = engine(Vec::new());
        let id = InstanceId::new("c");
        engine.orchestrator.add_device(sync_info("c", "10.0.0.4"));

        engine
            .wait_until(|o| o.handler(&InstanceId::new("c")).is_some())
            .await;
        assert_eq!(engine.state(&id).await, Some(ConnectState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_payload_token_connects_once() {
        let engine = engine(Vec::new());
        let id = InstanceId::new("d");
        let token = PairingToken::new(424242).unwrap();
        engine
            .peer
            .set_reachable(&id, &["10.0.0.5"], VersionRelation::EqualTo);
        engine.peer.accept_token(&id, token);

        engine
            .orchestrator
            .pair(SyncInfoPayload::new(sync_info("d", "10.0.0.5"), token));
        engine.wait_for_state(&id, ConnectState::Connected).await;

        let trusts = engine
            .peer
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::Trust(..)))
            .count();
        assert_eq!(trusts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unverified_device_trusts_by_token() {
        let id = InstanceId::new("e");
        let engine = engine(vec![sync_info("e", "10.0.0.6")]);
        let token = PairingToken::new(123456).unwrap();
        engine
            .peer
            .set_reachable(&id, &["10.0.0.6"], VersionRelation::EqualTo);
        engine.peer.accept_token(&id, token);

        engine.wait_for_state(&id, ConnectState::Unverified).await;
        assert!(engine.orchestrator.trust_by_token(&id, token).await);
        assert_eq!(engine.state(&id).await, Some(ConnectState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_record_disposes_handler_and_prunes_ignore_set() {
        let id = InstanceId::new("f");
        let keep = InstanceId::new("g");
        let engine = engine(vec![sync_info("f", "10.0.0.7"), sync_info("g", "10.0.0.8")]);
        engine.orchestrator.ignore_verify(&id);
        engine.orchestrator.ignore_verify(&keep);
        let handler = engine.orchestrator.handler(&id).unwrap();

        engine.store.delete(&id).await.unwrap();
        engine
            .wait_until(|o| o.handler(&InstanceId::new("f")).is_none())
            .await;

        assert!(handler.is_exited());
        assert!(!engine.orchestrator.is_verify_ignored(&id));
        assert!(engine.orchestrator.is_verify_ignored(&keep));
        engine.orchestrator.to_verify(&keep);
        assert!(!engine.orchestrator.is_verify_ignored(&keep));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_loss_keeps_the_record() {
        let id = InstanceId::new("h");
        let engine = engine(vec![sync_info("h", "10.0.0.9")]);
        engine.orchestrator.remove_device(&sync_info("h", "10.0.0.9"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.store.get(&id).await.unwrap().is_some());
        assert!(engine.orchestrator.handler(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unpair_removes_record_and_handler() {
        let id = InstanceId::new("i");
        let engine = engine(vec![sync_info("i", "10.0.0.10")]);
        engine.identities.cache_public_key(&id);

        assert!(engine.orchestrator.unpair(&id).await);
        assert!(engine.store.get(&id).await.unwrap().is_none());
        engine
            .wait_until(|o| o.handler(&InstanceId::new("i")).is_none())
            .await;
        assert!(!engine.orchestrator.unpair(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_calls_back_exactly_once() {
        let engine = engine(vec![sync_info("j", "10.0.0.11"), sync_info("k", "10.0.0.12")]);
        let calls = AtomicU32::new(0);

        engine
            .orchestrator
            .refresh(&[], || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine
            .orchestrator
            .refresh(&[InstanceId::new("unknown")], || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn update_flags_through_resolver() {
        let id = InstanceId::new("l");
        let engine = engine(vec![sync_info("l", "10.0.0.13")]);

        assert!(engine.orchestrator.update_allow_send(&id, false).await);
        assert!(engine.orchestrator.update_allow_receive(&id, false).await);
        assert!(
            engine
                .orchestrator
                .update_note_name(&id, Some("desk".into()))
                .await
        );
        let record = engine.store.get(&id).await.unwrap().unwrap();
        assert!(!record.allow_send);
        assert!(!record.allow_receive);
        assert_eq!(record.display_name(), "desk");
        assert!(
            !engine
                .orchestrator
                .update_allow_send(&InstanceId::new("nope"), true)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn locate_reports_typed_failures() {
        let engine = engine(vec![sync_info("m", "10.0.0.14")]);

        let missing = engine.orchestrator.locate(&InstanceId::new("zz")).await;
        assert!(matches!(missing, Err(PullError::NoSyncHandler(_))));

        let unreachable = engine.orchestrator.locate(&InstanceId::new("m")).await;
        assert!(matches!(unreachable, Err(PullError::AddressUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disposes_everything() {
        let engine = engine(vec![sync_info("n", "10.0.0.15")]);
        let handler = engine.orchestrator.handler(&InstanceId::new("n")).unwrap();
        engine.orchestrator.shutdown();
        assert!(handler.is_exited());
        assert!(engine.orchestrator.device_ids().is_empty());
    }
}
