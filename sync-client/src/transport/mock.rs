//! Mock peers for testing.
//!
//! One [`MockPeer`] stands in for the whole network: it answers wire calls
//! and reachability checks for any number of scripted peers and records every call for
//! verification.

use super::{ApiError, HostChecker, PeerAddress, SyncApi};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::PairingToken;
use sync_types::{HostInfo, InstanceId, PullChunkRequest, PullIconRequest, VersionRelation};

/// A recorded wire call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `heartbeat` to a peer.
    Heartbeat(InstanceId),
    /// `trust` with the given token value.
    Trust(InstanceId, u32),
    /// `show_token`.
    ShowToken(InstanceId),
    /// `notify_exit`.
    NotifyExit(InstanceId),
    /// `notify_remove`.
    NotifyRemove(InstanceId),
    /// `pull_file_chunk` for a chunk index.
    PullChunk(InstanceId, u32),
    /// `pull_icon` for a source.
    PullIcon(InstanceId, String),
}

#[derive(Debug)]
struct ScriptedPeer {
    reachable_hosts: Vec<String>,
    version: VersionRelation,
    heartbeat_script: VecDeque<Result<VersionRelation, ApiError>>,
    accepted_token: Option<u32>,
    chunks: HashMap<u32, Vec<u8>>,
    fail_chunks_once: HashSet<u32>,
    stalled_chunks: HashSet<u32>,
    icon: Option<Vec<u8>>,
    fail_icon: bool,
    fail_notify: bool,
}

impl Default for ScriptedPeer {
    fn default() -> Self {
        Self {
            reachable_hosts: Vec::new(),
            version: VersionRelation::EqualTo,
            heartbeat_script: VecDeque::new(),
            accepted_token: None,
            chunks: HashMap::new(),
            fail_chunks_once: HashSet::new(),
            stalled_chunks: HashSet::new(),
            icon: None,
            fail_icon: false,
            fail_notify: false,
        }
    }
}

impl ScriptedPeer {
    fn answers(&self, host: &str) -> bool {
        self.reachable_hosts.iter().any(|h| h == host)
    }
}

#[derive(Debug, Default)]
struct MockPeerInner {
    peers: HashMap<InstanceId, ScriptedPeer>,
    calls: Vec<MockCall>,
}

/// Mock network of peers.
///
/// Cloning shares state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MockPeer {
    inner: Arc<Mutex<MockPeerInner>>,
}

impl MockPeer {
    /// Create an empty mock network (every host unreachable).
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockPeerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_peer<R>(&self, id: &InstanceId, f: impl FnOnce(&mut ScriptedPeer) -> R) -> R {
        let mut inner = self.lock();
        f(inner.peers.entry(id.clone()).or_default())
    }

    /// Make `hosts` answer for `id`, reporting `version`.
    pub fn set_reachable(&self, id: &InstanceId, hosts: &[&str], version: VersionRelation) {
        self.with_peer(id, |peer| {
            peer.reachable_hosts = hosts.iter().map(|h| h.to_string()).collect();
            peer.version = version;
        });
    }

    /// Make every host of `id` stop answering.
    pub fn set_unreachable(&self, id: &InstanceId) {
        self.with_peer(id, |peer| peer.reachable_hosts.clear());
    }

    /// Queue a result for the next heartbeat to `id`.
    ///
    /// Without a scripted result a heartbeat to a reachable host succeeds
    /// with the peer's version relation.
    pub fn script_heartbeat(&self, id: &InstanceId, result: Result<VersionRelation, ApiError>) {
        self.with_peer(id, |peer| peer.heartbeat_script.push_back(result));
    }

    /// Token `id` accepts in `trust`.
    pub fn accept_token(&self, id: &InstanceId, token: PairingToken) {
        self.with_peer(id, |peer| peer.accepted_token = Some(token.value()));
    }

    /// Serve `chunks[i]` as chunk `i` of any paste.
    pub fn serve_chunks(&self, id: &InstanceId, chunks: Vec<Vec<u8>>) {
        self.with_peer(id, |peer| {
            peer.chunks = chunks
                .into_iter()
                .enumerate()
                .map(|(i, data)| (i as u32, data))
                .collect();
        });
    }

    /// Fail the next request for chunk `index` of `id`.
    pub fn fail_chunk_once(&self, id: &InstanceId, index: u32) {
        self.with_peer(id, |peer| {
            peer.fail_chunks_once.insert(index);
        });
    }

    /// Never answer requests for chunk `index` of `id`.
    pub fn stall_chunk(&self, id: &InstanceId, index: u32) {
        self.with_peer(id, |peer| {
            peer.stalled_chunks.insert(index);
        });
    }

    /// Serve `bytes` for any icon request to `id`.
    pub fn serve_icon(&self, id: &InstanceId, bytes: Vec<u8>) {
        self.with_peer(id, |peer| peer.icon = Some(bytes));
    }

    /// Make icon requests to `id` fail.
    pub fn fail_icons(&self, id: &InstanceId, fail: bool) {
        self.with_peer(id, |peer| peer.fail_icon = fail);
    }

    /// Make exit/remove notifications to `id` fail.
    pub fn fail_notifications(&self, id: &InstanceId, fail: bool) {
        self.with_peer(id, |peer| peer.fail_notify = fail);
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Chunk indices requested from `id`, in request order.
    pub fn chunk_requests(&self, id: &InstanceId) -> Vec<u32> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::PullChunk(peer, index) if peer == id => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }

    fn reachable(&self, target: &PeerAddress) -> Result<(), ApiError> {
        let inner = self.lock();
        match inner.peers.get(&target.instance_id) {
            Some(peer) if peer.answers(&target.host) => Ok(()),
            _ => Err(ApiError::Unreachable(target.host.clone())),
        }
    }
}

#[async_trait]
impl SyncApi for MockPeer {
    async fn heartbeat(&self, target: &PeerAddress) -> Result<VersionRelation, ApiError> {
        self.record(MockCall::Heartbeat(target.instance_id.clone()));
        let scripted = self.with_peer(&target.instance_id, |peer| peer.heartbeat_script.pop_front());
        if let Some(result) = scripted {
            return result;
        }
        self.reachable(target)?;
        Ok(self.with_peer(&target.instance_id, |peer| peer.version))
    }

    async fn trust(
        &self,
        target: &PeerAddress,
        token: PairingToken,
    ) -> Result<Vec<u8>, ApiError> {
        self.record(MockCall::Trust(target.instance_id.clone(), token.value()));
        self.reachable(target)?;
        let accepted = self.with_peer(&target.instance_id, |peer| peer.accepted_token);
        if accepted == Some(token.value()) {
            Ok(format!("pk:{}", target.instance_id).into_bytes())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    async fn show_token(&self, target: &PeerAddress) -> Result<(), ApiError> {
        self.record(MockCall::ShowToken(target.instance_id.clone()));
        self.reachable(target)
    }

    async fn notify_exit(&self, target: &PeerAddress) -> Result<(), ApiError> {
        self.record(MockCall::NotifyExit(target.instance_id.clone()));
        self.reachable(target)?;
        if self.with_peer(&target.instance_id, |peer| peer.fail_notify) {
            return Err(ApiError::Timeout);
        }
        Ok(())
    }

    async fn notify_remove(&self, target: &PeerAddress) -> Result<(), ApiError> {
        self.record(MockCall::NotifyRemove(target.instance_id.clone()));
        self.reachable(target)?;
        if self.with_peer(&target.instance_id, |peer| peer.fail_notify) {
            return Err(ApiError::Timeout);
        }
        Ok(())
    }

    async fn pull_file_chunk(
        &self,
        target: &PeerAddress,
        request: &PullChunkRequest,
    ) -> Result<Vec<u8>, ApiError> {
        let index = request.chunk_index;
        self.record(MockCall::PullChunk(target.instance_id.clone(), index));
        self.reachable(target)?;
        if self.with_peer(&target.instance_id, |peer| peer.stalled_chunks.contains(&index)) {
            std::future::pending::<()>().await;
        }
        self.with_peer(&target.instance_id, |peer| {
            if peer.fail_chunks_once.remove(&index) {
                return Err(ApiError::Timeout);
            }
            peer.chunks
                .get(&index)
                .cloned()
                .ok_or_else(|| ApiError::Remote {
                    code: super::error_code::CHUNK_OUT_OF_RANGE,
                    message: format!("no chunk {}", index),
                })
        })
    }

    async fn pull_icon(
        &self,
        target: &PeerAddress,
        request: &PullIconRequest,
    ) -> Result<Vec<u8>, ApiError> {
        self.record(MockCall::PullIcon(
            target.instance_id.clone(),
            request.source.clone(),
        ));
        self.reachable(target)?;
        self.with_peer(&target.instance_id, |peer| {
            if peer.fail_icon {
                return Err(ApiError::Timeout);
            }
            peer.icon.clone().ok_or_else(|| ApiError::Remote {
                code: super::error_code::NOT_FOUND,
                message: format!("no icon for {}", request.source),
            })
        })
    }
}

#[async_trait]
impl HostChecker for MockPeer {
    async fn best_reachable_host(
        &self,
        instance_id: &InstanceId,
        candidates: &[HostInfo],
        _port: u16,
    ) -> Option<(HostInfo, VersionRelation)> {
        let inner = self.lock();
        let peer = inner.peers.get(instance_id)?;
        candidates
            .iter()
            .find(|candidate| peer.answers(&candidate.host_address))
            .map(|host| (host.clone(), peer.version))
    }

    async fn check(
        &self,
        instance_id: &InstanceId,
        host: &str,
        _port: u16,
    ) -> Option<VersionRelation> {
        let inner = self.lock();
        let peer = inner.peers.get(instance_id)?;
        peer.answers(host).then_some(peer.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id() -> InstanceId {
        InstanceId::new("peer-a")
    }

    fn target(host: &str) -> PeerAddress {
        PeerAddress::new(peer_id(), host, 13129)
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let mock = MockPeer::new();
        let result = mock.heartbeat(&target("10.0.0.1")).await;
        assert!(matches!(result, Err(ApiError::Unreachable(_))));
        assert_eq!(mock.calls(), vec![MockCall::Heartbeat(peer_id())]);
    }

    #[tokio::test]
    async fn best_host_follows_candidate_order() {
        let mock = MockPeer::new();
        mock.set_reachable(&peer_id(), &["192.168.1.9", "10.0.0.1"], VersionRelation::Newer);

        let candidates = vec![
            HostInfo::new("172.16.0.1", 16),
            HostInfo::new("10.0.0.1", 8),
            HostInfo::new("192.168.1.9", 24),
        ];
        let (host, relation) = mock
            .best_reachable_host(&peer_id(), &candidates, 13129)
            .await
            .unwrap();
        assert_eq!(host.host_address, "10.0.0.1");
        assert_eq!(relation, VersionRelation::Newer);
        assert_eq!(mock.check(&peer_id(), "172.16.0.1", 13129).await, None);
    }

    #[tokio::test]
    async fn scripted_heartbeat_comes_first() {
        let mock = MockPeer::new();
        mock.set_reachable(&peer_id(), &["10.0.0.1"], VersionRelation::EqualTo);
        mock.script_heartbeat(&peer_id(), Err(ApiError::DecryptFailed));

        let first = mock.heartbeat(&target("10.0.0.1")).await;
        let second = mock.heartbeat(&target("10.0.0.1")).await;
        assert_eq!(first, Err(ApiError::DecryptFailed));
        assert_eq!(second, Ok(VersionRelation::EqualTo));
    }

    #[tokio::test]
    async fn trust_checks_token() {
        let mock = MockPeer::new();
        mock.set_reachable(&peer_id(), &["10.0.0.1"], VersionRelation::EqualTo);
        mock.accept_token(&peer_id(), PairingToken::new(424242).unwrap());

        let wrong = mock
            .trust(&target("10.0.0.1"), PairingToken::new(111111).unwrap())
            .await;
        assert_eq!(wrong, Err(ApiError::Unauthorized));
        let right = mock
            .trust(&target("10.0.0.1"), PairingToken::new(424242).unwrap())
            .await;
        assert_eq!(right, Ok(b"pk:peer-a".to_vec()));
    }

    #[tokio::test]
    async fn chunk_failure_is_one_shot() {
        let mock = MockPeer::new();
        mock.set_reachable(&peer_id(), &["10.0.0.1"], VersionRelation::EqualTo);
        mock.serve_chunks(&peer_id(), vec![b"abcd".to_vec(), b"ef".to_vec()]);
        mock.fail_chunk_once(&peer_id(), 1);

        let request = |index| PullChunkRequest {
            task_id: sync_types::TaskId::new(),
            paste_id: sync_types::PasteId::new(1),
            chunk_index: index,
        };
        assert!(mock.pull_file_chunk(&target("10.0.0.1"), &request(1)).await.is_err());
        assert_eq!(
            mock.pull_file_chunk(&target("10.0.0.1"), &request(1)).await.unwrap(),
            b"ef".to_vec()
        );
        assert!(mock.pull_file_chunk(&target("10.0.0.1"), &request(2)).await.is_err());
        assert_eq!(mock.chunk_requests(&peer_id()), vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let mock = MockPeer::new();
        let other = mock.clone();
        other.set_reachable(&peer_id(), &["10.0.0.1"], VersionRelation::EqualTo);
        assert_eq!(
            mock.check(&peer_id(), "10.0.0.1", 1).await,
            Some(VersionRelation::EqualTo)
        );
    }
}
