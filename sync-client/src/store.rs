//! Persistence collaborators.
//!
//! The storage engine itself lives outside this crate. These traits are the
//! contract the engine needs from it, and the `Memory*` types implement
//! them in memory for tests, the CLI simulation, and embedders that keep
//! peer state elsewhere.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use sync_types::{
    ConnectState, InstanceId, SyncInfo, SyncRuntimeInfo, TaskExtraInfo, TaskId, TaskType,
};
use tokio::sync::watch;

use crate::error::StoreError;

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persisted per-device records.
///
/// Every write stamps `modify_time` and is published to subscribers.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Live view of all records. The current value is available immediately.
    fn subscribe(&self) -> watch::Receiver<Vec<SyncRuntimeInfo>>;

    /// One record.
    async fn get(&self, id: &InstanceId) -> Result<Option<SyncRuntimeInfo>, StoreError>;

    /// All records.
    async fn get_all(&self) -> Result<Vec<SyncRuntimeInfo>, StoreError>;

    /// Merge an announcement into the existing record, or create a
    /// DISCONNECTED one. Connect state and user flags are never touched.
    async fn insert_or_update(&self, info: SyncInfo) -> Result<SyncRuntimeInfo, StoreError>;

    /// Set connect state and host. The host is dropped for states that may
    /// not carry one. `None` when the record does not exist.
    async fn update_connect_info(
        &self,
        id: &InstanceId,
        state: ConnectState,
        host: Option<String>,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError>;

    /// Set the allow-send flag.
    async fn update_allow_send(
        &self,
        id: &InstanceId,
        allow: bool,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError>;

    /// Set the allow-receive flag.
    async fn update_allow_receive(
        &self,
        id: &InstanceId,
        allow: bool,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError>;

    /// Set or clear the note name.
    async fn update_note_name(
        &self,
        id: &InstanceId,
        note_name: Option<String>,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, id: &InstanceId) -> Result<bool, StoreError>;
}

/// Cached peer public keys (the secure identity store).
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Whether we hold a trusted key for the peer.
    async fn exists_cached_public_key(&self, id: &InstanceId) -> Result<bool, StoreError>;

    /// Trust `key` as the peer's public key.
    async fn save_public_key(&self, id: &InstanceId, key: Vec<u8>) -> Result<(), StoreError>;

    /// Forget the peer's key.
    async fn delete_cached_public_key(&self, id: &InstanceId) -> Result<(), StoreError>;
}

/// Per-task retry metadata of the background task framework.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load the task's extra info; empty when nothing is stored.
    async fn load_extra_info(
        &self,
        task_id: TaskId,
        task_type: TaskType,
    ) -> Result<TaskExtraInfo, StoreError>;

    /// Replace the task's extra info.
    async fn save_extra_info(&self, task_id: TaskId, extra: &TaskExtraInfo)
        -> Result<(), StoreError>;

    /// Drop the task's extra info.
    async fn clear(&self, task_id: TaskId) -> Result<(), StoreError>;
}

/// In-memory [`RuntimeStore`] backed by a watch channel.
#[derive(Debug)]
pub struct MemoryRuntimeStore {
    records: watch::Sender<Vec<SyncRuntimeInfo>>,
}

impl MemoryRuntimeStore {
    /// Empty store.
    pub fn new() -> Self {
        let (records, _) = watch::channel(Vec::new());
        Self { records }
    }

    /// Store pre-populated with records (e.g. restored from disk).
    pub fn with_records(initial: Vec<SyncRuntimeInfo>) -> Self {
        let (records, _) = watch::channel(initial);
        Self { records }
    }

    fn modify_record(
        &self,
        id: &InstanceId,
        f: impl FnOnce(&mut SyncRuntimeInfo),
    ) -> Option<SyncRuntimeInfo> {
        let mut updated = None;
        self.records.send_if_modified(|records| {
            match records.iter_mut().find(|r| r.instance_id() == id) {
                Some(record) => {
                    f(record);
                    record.modify_time = now_millis();
                    updated = Some(record.clone());
                    true
                }
                None => false,
            }
        });
        updated
    }
}

impl Default for MemoryRuntimeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeStore for MemoryRuntimeStore {
    fn subscribe(&self) -> watch::Receiver<Vec<SyncRuntimeInfo>> {
        self.records.subscribe()
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<SyncRuntimeInfo>, StoreError> {
        Ok(self
            .records
            .borrow()
            .iter()
            .find(|r| r.instance_id() == id)
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<SyncRuntimeInfo>, StoreError> {
        Ok(self.records.borrow().clone())
    }

    async fn insert_or_update(&self, info: SyncInfo) -> Result<SyncRuntimeInfo, StoreError> {
        let now = now_millis();
        let mut result = None;
        self.records.send_if_modified(|records| {
            match records
                .iter_mut()
                .find(|r| r.instance_id() == info.instance_id())
            {
                Some(record) => match record.merge_sync_info(&info) {
                    Some(mut merged) => {
                        merged.modify_time = now;
                        *record = merged.clone();
                        result = Some(merged);
                        true
                    }
                    None => {
                        result = Some(record.clone());
                        false
                    }
                },
                None => {
                    let record = SyncRuntimeInfo::from_sync_info(info.clone(), now);
                    records.push(record.clone());
                    result = Some(record);
                    true
                }
            }
        });
        result.ok_or_else(|| StoreError::Backend("record vanished during upsert".into()))
    }

    async fn update_connect_info(
        &self,
        id: &InstanceId,
        state: ConnectState,
        host: Option<String>,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError> {
        Ok(self.modify_record(id, |record| {
            record.connect_state = state;
            record.connect_host_address = host.filter(|_| state.may_carry_host());
        }))
    }

    async fn update_allow_send(
        &self,
        id: &InstanceId,
        allow: bool,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError> {
        Ok(self.modify_record(id, |record| record.allow_send = allow))
    }

    async fn update_allow_receive(
        &self,
        id: &InstanceId,
        allow: bool,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError> {
        Ok(self.modify_record(id, |record| record.allow_receive = allow))
    }

    async fn update_note_name(
        &self,
        id: &InstanceId,
        note_name: Option<String>,
    ) -> Result<Option<SyncRuntimeInfo>, StoreError> {
        Ok(self.modify_record(id, |record| record.note_name = note_name))
    }

    async fn delete(&self, id: &InstanceId) -> Result<bool, StoreError> {
        Ok(self.records.send_if_modified(|records| {
            let before = records.len();
            records.retain(|r| r.instance_id() != id);
            records.len() != before
        }))
    }
}

/// In-memory [`IdentityStore`].
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    keys: DashMap<InstanceId, Vec<u8>>,
}

impl MemoryIdentityStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trusted (placeholder) key for the peer.
    pub fn cache_public_key(&self, id: &InstanceId) {
        self.keys.insert(id.clone(), Vec::new());
    }

    /// The stored key for the peer.
    pub fn public_key(&self, id: &InstanceId) -> Option<Vec<u8>> {
        self.keys.get(id).map(|key| key.value().clone())
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn exists_cached_public_key(&self, id: &InstanceId) -> Result<bool, StoreError> {
        Ok(self.keys.contains_key(id))
    }

    async fn save_public_key(&self, id: &InstanceId, key: Vec<u8>) -> Result<(), StoreError> {
        self.keys.insert(id.clone(), key);
        Ok(())
    }

    async fn delete_cached_public_key(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.keys.remove(id);
        Ok(())
    }
}

/// In-memory [`TaskStore`] keeping the encoded JSON form.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    blobs: DashMap<TaskId, String>,
}

impl MemoryTaskStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored JSON for a task, if any.
    pub fn raw(&self, task_id: TaskId) -> Option<String> {
        self.blobs.get(&task_id).map(|blob| blob.value().clone())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_extra_info(
        &self,
        task_id: TaskId,
        task_type: TaskType,
    ) -> Result<TaskExtraInfo, StoreError> {
        match self.blobs.get(&task_id) {
            Some(blob) => Ok(TaskExtraInfo::decode(task_type, blob.value())?),
            None => Ok(TaskExtraInfo::empty(task_type)),
        }
    }

    async fn save_extra_info(
        &self,
        task_id: TaskId,
        extra: &TaskExtraInfo,
    ) -> Result<(), StoreError> {
        let encoded = extra.encode()?;
        self.blobs.insert(task_id, encoded);
        Ok(())
    }

    async fn clear(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.blobs.remove(&task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{DeviceIdentity, HostInfo, Platform, PullExtraInfo};

    fn sync_info(id: &str, port: u16) -> SyncInfo {
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
            host_info_list: vec![HostInfo::new("10.0.0.7", 24)],
            port,
        }
    }

    #[tokio::test]
    async fn insert_creates_disconnected_record() {
        let store = MemoryRuntimeStore::new();
        let record = store.insert_or_update(sync_info("a", 1000)).await.unwrap();
        assert_eq!(record.connect_state, ConnectState::Disconnected);
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_link_state() {
        let store = MemoryRuntimeStore::new();
        let id = InstanceId::new("a");
        store.insert_or_update(sync_info("a", 1000)).await.unwrap();
        store
            .update_connect_info(&id, ConnectState::Connected, Some("10.0.0.7".into()))
            .await
            .unwrap();

        let merged = store.insert_or_update(sync_info("a", 2000)).await.unwrap();
        assert_eq!(merged.port, 2000);
        assert_eq!(merged.connect_state, ConnectState::Connected);
        assert_eq!(merged.connect_host_address.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn identical_upsert_does_not_notify() {
        let store = MemoryRuntimeStore::new();
        store.insert_or_update(sync_info("a", 1000)).await.unwrap();
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store.insert_or_update(sync_info("a", 1000)).await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn disconnected_write_drops_host() {
        let store = MemoryRuntimeStore::new();
        let id = InstanceId::new("a");
        store.insert_or_update(sync_info("a", 1000)).await.unwrap();

        let record = store
            .update_connect_info(&id, ConnectState::Disconnected, Some("10.0.0.7".into()))
            .await
            .unwrap()
            .unwrap();
        assert!(record.connect_host_address.is_none());
        assert!(record.host_binding_is_consistent());
    }

    #[tokio::test]
    async fn every_write_is_published() {
        let store = MemoryRuntimeStore::new();
        let id = InstanceId::new("a");
        store.insert_or_update(sync_info("a", 1000)).await.unwrap();
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store.update_allow_send(&id, false).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update()[0].allow_send);

        store.update_note_name(&id, Some("Desk".into())).await.unwrap();
        assert_eq!(rx.borrow_and_update()[0].display_name(), "Desk");
    }

    #[tokio::test]
    async fn update_missing_record_is_none() {
        let store = MemoryRuntimeStore::new();
        let result = store
            .update_allow_receive(&InstanceId::new("ghost"), false)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!store.delete(&InstanceId::new("ghost")).await.unwrap());
    }

    #[tokio::test]
    async fn identity_store_roundtrip() {
        let store = MemoryIdentityStore::new();
        let id = InstanceId::new("a");
        assert!(!store.exists_cached_public_key(&id).await.unwrap());
        store.cache_public_key(&id);
        assert!(store.exists_cached_public_key(&id).await.unwrap());
        store.delete_cached_public_key(&id).await.unwrap();
        assert!(!store.exists_cached_public_key(&id).await.unwrap());

        store.save_public_key(&id, vec![7, 7]).await.unwrap();
        assert_eq!(store.public_key(&id), Some(vec![7, 7]));
    }

    #[tokio::test]
    async fn task_store_keeps_encoded_json() {
        let store = MemoryTaskStore::new();
        let task_id = TaskId::new();
        let extra = TaskExtraInfo::PullFile(PullExtraInfo {
            pull_chunks: vec![1, 0, 1],
            execution_histories: vec![],
        });

        store.save_extra_info(task_id, &extra).await.unwrap();
        assert!(store.raw(task_id).unwrap().contains("\"pullChunks\":[1,0,1]"));
        assert_eq!(
            store.load_extra_info(task_id, TaskType::PullFile).await.unwrap(),
            extra
        );

        store.clear(task_id).await.unwrap();
        assert_eq!(
            store.load_extra_info(task_id, TaskType::PullFile).await.unwrap(),
            TaskExtraInfo::empty(TaskType::PullFile)
        );
    }
}
