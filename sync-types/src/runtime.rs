//! Persisted per-device link state.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::{DeviceIdentity, HostInfo, InstanceId, SyncInfo};

/// Health of the link to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectState {
    /// No reachable host.
    Disconnected,
    /// A reachable, version-compatible host was found; trust not yet checked.
    Connecting,
    /// Heartbeat or trust succeeded.
    Connected,
    /// Reachable, but the peer runs an incompatible protocol version.
    Incompatible,
    /// The peer failed identity verification; re-pairing is required.
    Unmatched,
    /// Reachable and compatible, waiting for token trust.
    Unverified,
}

impl ConnectState {
    /// States the poll loop treats as failures (backoff grows while in them).
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Incompatible | Self::Unmatched | Self::Unverified
        )
    }

    /// Whether a record in this state may carry a connect host address.
    ///
    /// UNMATCHED drops the binding: the peer must be re-paired before any
    /// host is trusted again.
    pub fn may_carry_host(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Unverified | Self::Incompatible
        )
    }
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Incompatible => "INCOMPATIBLE",
            Self::Unmatched => "UNMATCHED",
            Self::Unverified => "UNVERIFIED",
        };
        f.write_str(name)
    }
}

/// Local protocol version compared with a peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionRelation {
    /// Same version; the link may become CONNECTED.
    EqualTo,
    /// The peer is older than us.
    Older,
    /// The peer is newer than us.
    Newer,
}

impl VersionRelation {
    /// Compare dotted numeric versions component by component.
    ///
    /// Missing components count as zero and any non-numeric suffix of a
    /// component ("3-beta") is ignored, so `"1.2"` equals `"1.2.0"`.
    pub fn between(local: &str, remote: &str) -> Self {
        let local = parse_version(local);
        let remote = parse_version(remote);
        let len = local.len().max(remote.len());

        for i in 0..len {
            let l = local.get(i).copied().unwrap_or(0);
            let r = remote.get(i).copied().unwrap_or(0);
            match r.cmp(&l) {
                Ordering::Less => return Self::Older,
                Ordering::Greater => return Self::Newer,
                Ordering::Equal => {}
            }
        }
        Self::EqualTo
    }

    /// Whether the versions match.
    pub fn is_equal(self) -> bool {
        matches!(self, Self::EqualTo)
    }
}

fn parse_version(version: &str) -> Vec<u64> {
    version
        .trim()
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// The persisted record for one paired or discovered peer.
///
/// Created when the peer is first discovered, mutated only by the resolver,
/// removed when the peer is unpaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRuntimeInfo {
    /// Who the peer is.
    pub identity: DeviceIdentity,
    /// App/protocol version last announced by the peer.
    pub app_version: String,
    /// Candidate addresses.
    pub host_info_list: Vec<HostInfo>,
    /// Port the peer's sync server listens on.
    pub port: u16,
    /// Link health.
    pub connect_state: ConnectState,
    /// Host the link is bound to; `None` whenever DISCONNECTED.
    pub connect_host_address: Option<String>,
    /// Whether local clipboard changes are pushed to this peer.
    pub allow_send: bool,
    /// Whether clipboard changes from this peer are accepted.
    pub allow_receive: bool,
    /// User-chosen label overriding the device name.
    pub note_name: Option<String>,
    /// Unix millis when the record was created.
    pub create_time: u64,
    /// Unix millis of the last write.
    pub modify_time: u64,
}

impl SyncRuntimeInfo {
    /// Create a fresh DISCONNECTED record for a newly discovered peer.
    pub fn from_sync_info(info: SyncInfo, now_millis: u64) -> Self {
        Self {
            identity: info.identity,
            app_version: info.app_version,
            host_info_list: info.host_info_list,
            port: info.port,
            connect_state: ConnectState::Disconnected,
            connect_host_address: None,
            allow_send: true,
            allow_receive: true,
            note_name: None,
            create_time: now_millis,
            modify_time: now_millis,
        }
    }

    /// The instance id this record is keyed by.
    pub fn instance_id(&self) -> &InstanceId {
        &self.identity.instance_id
    }

    /// Label to show for this peer.
    pub fn display_name(&self) -> &str {
        self.note_name
            .as_deref()
            .unwrap_or(&self.identity.device_name)
    }

    /// Rebuild the announced view of this peer.
    pub fn sync_info(&self) -> SyncInfo {
        SyncInfo {
            identity: self.identity.clone(),
            app_version: self.app_version.clone(),
            host_info_list: self.host_info_list.clone(),
            port: self.port,
        }
    }

    /// Merge a fresh announcement into this record.
    ///
    /// Connect state, host binding and user flags are kept. Returns `None`
    /// when nothing announced differs from what is stored.
    pub fn merge_sync_info(&self, info: &SyncInfo) -> Option<Self> {
        if self.sync_info() == *info {
            return None;
        }
        let mut merged = self.clone();
        merged.identity = info.identity.clone();
        merged.app_version = info.app_version.clone();
        merged.host_info_list = info.host_info_list.clone();
        merged.port = info.port;
        Some(merged)
    }

    /// Check the host-address invariant: never bound while DISCONNECTED.
    pub fn host_binding_is_consistent(&self) -> bool {
        self.connect_host_address.is_none() || self.connect_state.may_carry_host()
    }
}
