//! Per-device state machine driver.
//!
//! A [`DeviceHandler`] owns two tasks:
//! - the reactive loop, which diffs every new record value against the
//!   previous one with [`sync_core::transition`] and emits the resulting
//!   events
//! - the poll loop, which emits a self-healing `ResolveConnection` every
//!   time its [`PollingScheduler`] says a poll is due
//!
//! Neither task holds the handler itself, so dropping or disposing the
//! handler stops both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use sync_core::{transition, Action, PairingToken, ResolveWay};
use sync_types::{InstanceId, SyncRuntimeInfo, VersionRelation};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::event::{Completion, EventSender, SyncEvent};
use crate::scheduler::PollingScheduler;
use crate::transport::PeerAddress;

/// Drives one device's link state.
#[derive(Debug)]
pub struct DeviceHandler {
    instance_id: InstanceId,
    info: watch::Sender<SyncRuntimeInfo>,
    scheduler: Arc<PollingScheduler>,
    events: EventSender,
    config: EngineConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    exited: AtomicBool,
}

impl DeviceHandler {
    /// Create a handler for `info` and start its loops.
    ///
    /// The first observed value dispatches the initial resolve event.
    pub fn spawn(info: SyncRuntimeInfo, events: EventSender, config: &EngineConfig) -> Arc<Self> {
        let instance_id = info.instance_id().clone();
        let (tx, _) = watch::channel(info);
        let scheduler = Arc::new(PollingScheduler::new(
            config.polling.backoff_policy(),
            config.polling.tick(),
        ));

        let reactive = tokio::spawn(reactive_loop(
            tx.subscribe(),
            Arc::clone(&scheduler),
            events.clone(),
        ));
        let poll = tokio::spawn(poll_loop(
            tx.subscribe(),
            Arc::clone(&scheduler),
            events.clone(),
        ));

        debug!("device handler started for {}", instance_id);

        Arc::new(Self {
            instance_id,
            info: tx,
            scheduler,
            events,
            config: config.clone(),
            tasks: Mutex::new(vec![reactive, poll]),
            exited: AtomicBool::new(false),
        })
    }

    /// The device this handler drives.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Latest record value.
    pub fn current(&self) -> SyncRuntimeInfo {
        self.info.borrow().clone()
    }

    /// Watch the record values this handler sees.
    pub fn subscribe(&self) -> watch::Receiver<SyncRuntimeInfo> {
        self.info.subscribe()
    }

    /// The handler's poll scheduler.
    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    /// Push a new record value. Identical values are ignored.
    pub fn update(&self, info: SyncRuntimeInfo) {
        self.info.send_if_modified(|current| {
            if *current == info {
                false
            } else {
                *current = info;
                true
            }
        });
    }

    /// Whether exit or removal has already been requested.
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SyncEvent) -> bool {
        if self.is_exited() {
            debug!("handler for {} is inert, dropping {}", self.instance_id, event.name());
            return false;
        }
        self.events.send(event)
    }

    async fn await_completion<T>(&self, rx: oneshot::Receiver<T>, sent: bool) -> Option<T> {
        if !sent {
            return None;
        }
        rx.await.ok()
    }

    /// Emit a fire-and-forget `ResolveConnection`.
    pub fn resolve(&self) {
        self.emit(SyncEvent::resolve(
            ResolveWay::Connection,
            self.current(),
            Completion::none(),
        ));
    }

    /// Refresh discovery and resolve, bypassing the backoff wait.
    ///
    /// Returns the version relation the resolve found, if any.
    pub async fn force_resolve(&self) -> Option<VersionRelation> {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::resolve(
            ResolveWay::ForceConnection,
            self.current(),
            done,
        ));
        self.await_completion(rx, sent).await.flatten()
    }

    /// The bound host address.
    ///
    /// When none is cached, triggers a resolve and waits one bounded delay
    /// for an address to show up. May still return `None`.
    pub async fn connect_host_address(&self) -> Option<String> {
        let mut rx = self.info.subscribe();
        if let Some(host) = rx.borrow_and_update().connect_host_address.clone() {
            return Some(host);
        }

        self.resolve();
        let wait = async {
            while rx.changed().await.is_ok() {
                if rx.borrow_and_update().connect_host_address.is_some() {
                    break;
                }
            }
        };
        let _ = timeout(self.config.handler.address_wait(), wait).await;

        self.current().connect_host_address
    }

    /// Live address of the peer for wire calls.
    pub async fn peer_address(&self) -> Option<PeerAddress> {
        let host = self.connect_host_address().await?;
        Some(PeerAddress::new(
            self.instance_id.clone(),
            host,
            self.current().port,
        ))
    }

    /// Submit a pairing token. Only effective while UNVERIFIED.
    pub async fn trust_by_token(&self, token: PairingToken) -> bool {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::TrustByToken {
            info: self.current(),
            token,
            done,
        });
        self.await_completion(rx, sent).await.unwrap_or(false)
    }

    /// Change the allow-send flag.
    pub async fn update_allow_send(&self, allow: bool) {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::UpdateAllowSend {
            info: self.current(),
            allow,
            done,
        });
        self.await_completion(rx, sent).await;
    }

    /// Change the allow-receive flag.
    pub async fn update_allow_receive(&self, allow: bool) {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::UpdateAllowReceive {
            info: self.current(),
            allow,
            done,
        });
        self.await_completion(rx, sent).await;
    }

    /// Change the note name.
    pub async fn update_note_name(&self, note_name: Option<String>) {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::UpdateNoteName {
            info: self.current(),
            note_name,
            done,
        });
        self.await_completion(rx, sent).await;
    }

    /// Ask the peer to display its pairing token.
    pub async fn show_token(&self) {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::ShowToken {
            info: self.current(),
            done,
        });
        self.await_completion(rx, sent).await;
    }

    /// The peer announced its exit: force DISCONNECTED.
    pub async fn mark_exit(&self) {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::MarkExit {
            info: self.current(),
            done,
        });
        self.await_completion(rx, sent).await;
    }

    /// Best-effort exit notification, then stop. One-shot.
    pub async fn notify_exit(&self) {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::NotifyExit {
            info: self.current(),
            done,
        });
        if !self.exited.swap(true, Ordering::SeqCst) && sent {
            let wait = self.config.handler.exit_notify_timeout();
            if timeout(wait, rx).await.is_err() {
                warn!("exit notification to {} timed out", self.instance_id);
            }
        }
        self.cancel_tasks();
    }

    /// Unpair the device, then stop. One-shot.
    pub async fn remove_device(&self) {
        let (done, rx) = Completion::channel();
        let sent = self.emit(SyncEvent::RemoveDevice {
            info: self.current(),
            done,
        });
        if !self.exited.swap(true, Ordering::SeqCst) && sent {
            let _ = rx.await;
        }
        self.cancel_tasks();
    }

    /// Stop both loops without notifying anyone.
    pub fn dispose(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.cancel_tasks();
    }

    fn cancel_tasks(&self) {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if !tasks.is_empty() {
            debug!("device handler stopped for {}", self.instance_id);
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for DeviceHandler {
    fn drop(&mut self) {
        self.cancel_tasks();
    }
}

async fn reactive_loop(
    mut rx: watch::Receiver<SyncRuntimeInfo>,
    scheduler: Arc<PollingScheduler>,
    events: EventSender,
) {
    let mut previous: Option<SyncRuntimeInfo> = None;
    loop {
        let current = rx.borrow_and_update().clone();
        for action in transition(previous.as_ref(), &current) {
            match action {
                Action::Resolve(way) => {
                    events.send(SyncEvent::resolve(way, current.clone(), Completion::none()));
                }
                Action::RefreshSyncInfo => {
                    events.send(SyncEvent::RefreshSyncInfo {
                        instance_id: current.instance_id().clone(),
                    });
                }
                Action::SchedulerFail => scheduler.fail(),
                Action::SchedulerReset => scheduler.reset(),
            }
        }
        previous = Some(current);

        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn poll_loop(
    rx: watch::Receiver<SyncRuntimeInfo>,
    scheduler: Arc<PollingScheduler>,
    events: EventSender,
) {
    scheduler
        .run(|| {
            let info = rx.borrow().clone();
            events.send(SyncEvent::resolve(
                ResolveWay::Connection,
                info,
                Completion::none(),
            ));
            std::future::ready(())
        })
        .await;
}
