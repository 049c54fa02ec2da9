//! Events flowing from device handlers to the resolver.
//!
//! Handlers never wait for an event to be processed unless they asked for
//! a [`Completion`]; sending is fire-and-forget onto an unbounded queue
//! with exactly one consumer.

use std::fmt;
use sync_core::{PairingToken, ResolveWay};
use sync_types::{InstanceId, SyncInfo, SyncRuntimeInfo, VersionRelation};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Optional continuation an event reports its result through.
pub struct Completion<T>(Option<oneshot::Sender<T>>);

impl<T> Completion<T> {
    /// A completion paired with the receiver that will see the result.
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Nobody is waiting for the result.
    pub fn none() -> Self {
        Self(None)
    }

    /// Deliver the result. A receiver that has gone away is ignored.
    pub fn complete(self, value: T) {
        if let Some(tx) = self.0 {
            let _ = tx.send(value);
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Completion(waiting)"),
            None => f.write_str("Completion(none)"),
        }
    }
}

/// One unit of work for the resolver.
#[derive(Debug)]
pub enum SyncEvent {
    /// Find a reachable host from scratch.
    ResolveDisconnected {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports the version relation found, if any.
        done: Completion<Option<VersionRelation>>,
    },
    /// Verify the bound host.
    ResolveConnecting {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports the version relation found, if any.
        done: Completion<Option<VersionRelation>>,
    },
    /// Resolve by the record's own state.
    ResolveConnection {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports the version relation found, if any.
        done: Completion<Option<VersionRelation>>,
    },
    /// Refresh discovery, then resolve by the record's state.
    ForceResolveConnection {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports the version relation found, if any.
        done: Completion<Option<VersionRelation>>,
    },
    /// Submit a pairing token to an UNVERIFIED peer.
    TrustByToken {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Token to present.
        token: PairingToken,
        /// Reports whether the peer became CONNECTED.
        done: Completion<bool>,
    },
    /// Change the allow-send flag.
    UpdateAllowSend {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// New value.
        allow: bool,
        /// Reports completion.
        done: Completion<()>,
    },
    /// Change the allow-receive flag.
    UpdateAllowReceive {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// New value.
        allow: bool,
        /// Reports completion.
        done: Completion<()>,
    },
    /// Change the note name.
    UpdateNoteName {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// New value.
        note_name: Option<String>,
        /// Reports completion.
        done: Completion<()>,
    },
    /// Ask the peer to display its pairing token.
    ShowToken {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports completion.
        done: Completion<()>,
    },
    /// Tell the peer we are exiting.
    NotifyExit {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports completion.
        done: Completion<()>,
    },
    /// The peer told us it is exiting: force DISCONNECTED locally.
    MarkExit {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports completion.
        done: Completion<()>,
    },
    /// Unpair: drop identity and record, then notify the peer.
    RemoveDevice {
        /// Record snapshot at emission time.
        info: SyncRuntimeInfo,
        /// Reports completion.
        done: Completion<()>,
    },
    /// Ask discovery for fresh info about a device.
    RefreshSyncInfo {
        /// Which device.
        instance_id: InstanceId,
    },
    /// Merge a discovery announcement into the persisted record.
    UpdateSyncInfo {
        /// The announcement.
        sync_info: SyncInfo,
    },
}

impl SyncEvent {
    /// Build the resolve event for `way`.
    pub fn resolve(
        way: ResolveWay,
        info: SyncRuntimeInfo,
        done: Completion<Option<VersionRelation>>,
    ) -> Self {
        match way {
            ResolveWay::Disconnected => Self::ResolveDisconnected { info, done },
            ResolveWay::Connecting => Self::ResolveConnecting { info, done },
            ResolveWay::Connection => Self::ResolveConnection { info, done },
            ResolveWay::ForceConnection => Self::ForceResolveConnection { info, done },
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResolveDisconnected { .. } => "resolve_disconnected",
            Self::ResolveConnecting { .. } => "resolve_connecting",
            Self::ResolveConnection { .. } => "resolve_connection",
            Self::ForceResolveConnection { .. } => "force_resolve_connection",
            Self::TrustByToken { .. } => "trust_by_token",
            Self::UpdateAllowSend { .. } => "update_allow_send",
            Self::UpdateAllowReceive { .. } => "update_allow_receive",
            Self::UpdateNoteName { .. } => "update_note_name",
            Self::ShowToken { .. } => "show_token",
            Self::NotifyExit { .. } => "notify_exit",
            Self::MarkExit { .. } => "mark_exit",
            Self::RemoveDevice { .. } => "remove_device",
            Self::RefreshSyncInfo { .. } => "refresh_sync_info",
            Self::UpdateSyncInfo { .. } => "update_sync_info",
        }
    }

    /// The device the event concerns.
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::ResolveDisconnected { info, .. }
            | Self::ResolveConnecting { info, .. }
            | Self::ResolveConnection { info, .. }
            | Self::ForceResolveConnection { info, .. }
            | Self::TrustByToken { info, .. }
            | Self::UpdateAllowSend { info, .. }
            | Self::UpdateAllowReceive { info, .. }
            | Self::UpdateNoteName { info, .. }
            | Self::ShowToken { info, .. }
            | Self::NotifyExit { info, .. }
            | Self::MarkExit { info, .. }
            | Self::RemoveDevice { info, .. } => info.instance_id(),
            Self::RefreshSyncInfo { instance_id } => instance_id,
            Self::UpdateSyncInfo { sync_info } => sync_info.instance_id(),
        }
    }
}

/// Producer side of the resolver's event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl EventSender {
    /// Create the queue. The receiver goes to the resolver's event loop.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue an event without waiting. Returns `false` when the resolver
    /// has stopped, in which case the event (and its completion) is dropped.
    pub fn send(&self, event: SyncEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                debug!(
                    "resolver stopped, dropping {} for {}",
                    event.name(),
                    event.instance_id()
                );
                false
            }
        }
    }

    /// Whether the resolver has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
