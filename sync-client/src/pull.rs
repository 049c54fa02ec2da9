//! Resumable chunked file pull.
//!
//! One [`ChunkTransferEngine::execute`] call is one attempt of a pull task.
//! The completion bitmap persisted in the task's extra info is the only
//! resume state: an attempt requests exactly the chunks still pending and
//! records every chunk it finishes, so the next attempt picks up where this
//! one stopped.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use sync_core::{ChunkBitmap, FilesChunk, FilesIndex, IndexedFile};
use sync_types::{
    ExecutionHistory, InstanceId, PasteId, PullChunkRequest, PullExtraInfo, TaskExtraInfo, TaskId,
    TaskType,
};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PullConfig;
use crate::error::{PullError, StoreError};
use crate::lock::StripedLock;
use crate::orchestrator::PeerLocator;
use crate::progress::{ProgressEntry, PullProgress};
use crate::store::{now_millis, TaskStore};
use crate::transport::{PeerAddress, SyncApi};

const SIGNAL_CAPACITY: usize = 64;

/// One file of a paste as announced by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullFileItem {
    /// File name (any directory part is ignored).
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

impl PullFileItem {
    /// Create an item.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// A file pull task as handed over by the task framework.
#[derive(Debug, Clone)]
pub struct PullFileTask {
    /// Task id; keys the persisted extra info and the chunk requests.
    pub task_id: TaskId,
    /// Paste the files belong to.
    pub paste_id: PasteId,
    /// Device serving the files.
    pub remote: InstanceId,
    /// Files in item order.
    pub files: Vec<PullFileItem>,
}

/// What the task framework should do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Done; do not run again.
    Success,
    /// Failed with budget left; run again later.
    NeedsRetry {
        /// Why this attempt failed.
        message: String,
    },
    /// Failed for good; do not run again.
    Failed {
        /// Why the last attempt failed.
        message: String,
    },
    /// The attempt was cancelled; the chunks it finished are persisted and
    /// the attempt does not count against the budget.
    Cancelled,
}

/// Terminal outcome of a transfer, broadcast once per transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSignal {
    /// All chunks pulled and delivered.
    PullSucceeded {
        /// Task id.
        task_id: TaskId,
        /// Paste id.
        paste_id: PasteId,
    },
    /// Retries exhausted or fatal error; partial files removed.
    PullFailed {
        /// Task id.
        task_id: TaskId,
        /// Paste id.
        paste_id: PasteId,
        /// Last failure.
        message: String,
    },
    /// Icon written.
    IconPulled {
        /// Task id.
        task_id: TaskId,
    },
    /// Icon pull gave up.
    IconFailed {
        /// Task id.
        task_id: TaskId,
        /// Last failure.
        message: String,
    },
}

/// Receives the result of a pull.
#[async_trait]
pub trait PasteConsumer: Send + Sync {
    /// Rewrite item names in the paste's metadata (`(old, new)` pairs).
    async fn apply_renames(
        &self,
        paste_id: PasteId,
        renames: &[(String, String)],
    ) -> Result<(), StoreError>;

    /// Hand over the pulled files, in item order.
    async fn deliver(&self, paste_id: PasteId, paths: Vec<PathBuf>) -> Result<(), StoreError>;

    /// The pull failed for good: drop the paste.
    async fn invalidate(&self, paste_id: PasteId);
}

/// A call recorded by [`MemoryPasteConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCall {
    /// `apply_renames`
    Renamed(PasteId, Vec<(String, String)>),
    /// `deliver`
    Delivered(PasteId, Vec<PathBuf>),
    /// `invalidate`
    Invalidated(PasteId),
}

/// [`PasteConsumer`] that records what it is told.
#[derive(Debug, Default)]
pub struct MemoryPasteConsumer {
    calls: Mutex<Vec<ConsumerCall>>,
}

impl MemoryPasteConsumer {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls so far, oldest first.
    pub fn calls(&self) -> Vec<ConsumerCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: ConsumerCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

#[async_trait]
impl PasteConsumer for MemoryPasteConsumer {
    async fn apply_renames(
        &self,
        paste_id: PasteId,
        renames: &[(String, String)],
    ) -> Result<(), StoreError> {
        self.record(ConsumerCall::Renamed(paste_id, renames.to_vec()));
        Ok(())
    }

    async fn deliver(&self, paste_id: PasteId, paths: Vec<PathBuf>) -> Result<(), StoreError> {
        self.record(ConsumerCall::Delivered(paste_id, paths));
        Ok(())
    }

    async fn invalidate(&self, paste_id: PasteId) {
        self.record(ConsumerCall::Invalidated(paste_id));
    }
}

/// Local names for `items`, in item order.
///
/// Directory parts are stripped and clashes get a numbered suffix: the
/// second `a.txt` becomes `a(1).txt`. Depends only on the item list.
pub fn resolve_names(items: &[PullFileItem]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    items
        .iter()
        .map(|item| {
            let base = Path::new(&item.name)
                .file_name()
                .and_then(|name| name.to_str())
                .filter(|name| !name.is_empty())
                .unwrap_or("file")
                .to_string();

            let mut candidate = base.clone();
            let mut n = 1;
            while used.contains(&candidate) {
                candidate = numbered(&base, n);
                n += 1;
            }
            used.insert(candidate.clone());
            candidate
        })
        .collect()
}

fn numbered(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{}({})", name, n),
    }
}

/// Executes file pull attempts.
pub struct ChunkTransferEngine {
    locator: Arc<dyn PeerLocator>,
    api: Arc<dyn SyncApi>,
    tasks: Arc<dyn TaskStore>,
    consumer: Arc<dyn PasteConsumer>,
    progress: Arc<PullProgress>,
    locks: StripedLock,
    signals: broadcast::Sender<TransferSignal>,
    files_root: PathBuf,
    chunk_size: u64,
    max_concurrency: usize,
}

impl ChunkTransferEngine {
    /// Create an engine writing pastes under `files_root`.
    pub fn new(
        locator: Arc<dyn PeerLocator>,
        api: Arc<dyn SyncApi>,
        tasks: Arc<dyn TaskStore>,
        consumer: Arc<dyn PasteConsumer>,
        files_root: impl Into<PathBuf>,
        config: &PullConfig,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            locator,
            api,
            tasks,
            consumer,
            progress: Arc::new(PullProgress::new()),
            locks: StripedLock::new(config.lock_stripes),
            signals,
            files_root: files_root.into(),
            chunk_size: config.chunk_size,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Receive terminal transfer signals.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferSignal> {
        self.signals.subscribe()
    }

    /// Sender side of the signal channel, for other pullers to share.
    pub fn signal_sender(&self) -> broadcast::Sender<TransferSignal> {
        self.signals.clone()
    }

    /// Progress of in-flight transfers.
    pub fn progress(&self) -> &Arc<PullProgress> {
        &self.progress
    }

    /// Directory a paste's files are written to.
    pub fn paste_dir(&self, paste_id: PasteId) -> PathBuf {
        self.files_root.join(paste_id.to_string())
    }

    /// Run one attempt (1-based) of `task`.
    pub async fn execute(&self, task: &PullFileTask, attempt: u32) -> TaskOutcome {
        self.execute_cancellable(task, attempt, &CancellationToken::new())
            .await
    }

    /// Run one attempt of `task`, stopping early once `cancel` fires.
    ///
    /// In-flight chunk requests are aborted; chunks already written stay
    /// marked in the persisted bitmap.
    pub async fn execute_cancellable(
        &self,
        task: &PullFileTask,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let start_time = now_millis();
        let names = resolve_names(&task.files);
        debug!(
            "pull {} for paste {} from {}, attempt {}",
            task.task_id, task.paste_id, task.remote, attempt
        );

        let mut extra = PullExtraInfo::default();
        let result = match self.load_extra(task.task_id).await {
            Ok(loaded) => {
                extra = loaded;
                self.run_attempt(task, &names, &mut extra, cancel).await
            }
            Err(e) => Err(e.into()),
        };
        let result = match result {
            Ok(()) => self.complete(task, &names).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => TaskOutcome::Success,
            Err(PullError::Cancelled) => {
                info!("pull {} attempt {} cancelled", task.task_id, attempt);
                self.save_extra(task.task_id, extra).await;
                TaskOutcome::Cancelled
            }
            Err(e) => {
                let message = e.to_string();
                extra.execution_histories.push(ExecutionHistory::failure(
                    start_time,
                    now_millis(),
                    message.clone(),
                ));

                if e.is_retryable() && attempt < TaskType::PullFile.max_attempts() {
                    info!(
                        "pull {} attempt {} failed, will retry: {}",
                        task.task_id, attempt, message
                    );
                    self.save_extra(task.task_id, extra).await;
                    return TaskOutcome::NeedsRetry { message };
                }

                warn!("pull {} failed for good: {}", task.task_id, message);
                extra.pull_chunks.clear();
                self.save_extra(task.task_id, extra).await;
                self.abandon(task, &message).await;
                TaskOutcome::Failed { message }
            }
        }
    }

    async fn load_extra(&self, task_id: TaskId) -> Result<PullExtraInfo, StoreError> {
        match self.tasks.load_extra_info(task_id, TaskType::PullFile).await? {
            TaskExtraInfo::PullFile(info) => Ok(info),
            other => Err(StoreError::Backend(format!(
                "expected {} extra info, found {}",
                TaskType::PullFile,
                other.task_type()
            ))),
        }
    }

    async fn save_extra(&self, task_id: TaskId, extra: PullExtraInfo) {
        if let Err(e) = self
            .tasks
            .save_extra_info(task_id, &TaskExtraInfo::PullFile(extra))
            .await
        {
            error!("failed to persist pull state of {}: {}", task_id, e);
        }
    }

    /// Pull every pending chunk. The bitmap in `extra` is updated whatever
    /// the outcome.
    async fn run_attempt(
        &self,
        task: &PullFileTask,
        names: &[String],
        extra: &mut PullExtraInfo,
        cancel: &CancellationToken,
    ) -> Result<(), PullError> {
        let index = FilesIndex::build(
            names
                .iter()
                .zip(&task.files)
                .map(|(name, item)| IndexedFile::new(name.clone(), item.size))
                .collect(),
            self.chunk_size,
        );

        let bitmap = if extra.pull_chunks.is_empty() {
            ChunkBitmap::new(index.chunk_count())
        } else {
            let bitmap = ChunkBitmap::from_persisted(&extra.pull_chunks);
            if bitmap.len() != index.chunk_count() {
                return Err(PullError::ChunkCountMismatch {
                    persisted: bitmap.len(),
                    rebuilt: index.chunk_count(),
                });
            }
            bitmap
        };

        // Dropping this future mid-attempt must not leave the entry behind
        let tracking = self.progress.track_guarded(task.paste_id, bitmap);
        let result = self
            .pull_pending(task, &index, tracking.entry(), cancel)
            .await;
        extra.pull_chunks = tracking.entry().snapshot().to_persisted();
        if !matches!(result, Err(PullError::Cancelled)) {
            tracking.keep();
        }
        result
    }

    async fn pull_pending(
        &self,
        task: &PullFileTask,
        index: &FilesIndex,
        entry: &Arc<ProgressEntry>,
        cancel: &CancellationToken,
    ) -> Result<(), PullError> {
        let pending = entry.snapshot().pending();
        if pending.is_empty() {
            return Ok(());
        }

        let address = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PullError::Cancelled),
            address = self.locator.locate(&task.remote) => address?,
        };
        let paths = self.prepare_files(task.paste_id, index).await?;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut set = JoinSet::new();
        for &i in &pending {
            let chunk = *index
                .chunk(i)
                .ok_or(PullError::ChunkIndexOutOfRange {
                    index: i,
                    count: index.chunk_count(),
                })?;
            let request = PullChunkRequest {
                task_id: task.task_id,
                paste_id: task.paste_id,
                chunk_index: chunk.index,
            };
            let path = paths[chunk.file_index].clone();
            let api = Arc::clone(&self.api);
            let address = address.clone();
            let semaphore = Arc::clone(&semaphore);
            let entry = Arc::clone(entry);

            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => fetch_chunk(api.as_ref(), &address, &request, &chunk, &path).await,
                    Err(_) => Err(PullError::Cancelled),
                };
                if result.is_ok() {
                    entry.mark_done(chunk.index as usize);
                }
                (chunk.index, result)
            });
        }

        // Collect every outcome; one failure must not hide another.
        let mut succeeded = HashSet::new();
        let mut first_error: Option<String> = None;
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    semaphore.close();
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    return Err(PullError::Cancelled);
                }
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((index, Ok(()))) => {
                    succeeded.insert(index);
                }
                Ok((index, Err(e))) => {
                    debug!("chunk {} of {} failed: {}", index, task.task_id, e);
                    first_error.get_or_insert_with(|| e.to_string());
                }
                Err(e) if e.is_cancelled() => {
                    set.abort_all();
                    return Err(PullError::Cancelled);
                }
                Err(e) => {
                    error!("chunk task of {} panicked: {}", task.task_id, e);
                    first_error.get_or_insert_with(|| format!("chunk task panicked: {}", e));
                }
            }
        }

        let failed: Vec<u32> = pending
            .iter()
            .map(|&i| i as u32)
            .filter(|i| !succeeded.contains(i))
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        Err(PullError::ChunksFailed {
            failed,
            first: first_error.unwrap_or_default(),
        })
    }

    /// Create the paste's files at their final sizes. Existing content is
    /// kept so chunks done by earlier attempts survive.
    async fn prepare_files(
        &self,
        paste_id: PasteId,
        index: &FilesIndex,
    ) -> Result<Vec<PathBuf>, PullError> {
        let dir = self.paste_dir(paste_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut paths = Vec::with_capacity(index.files().len());
        for file in index.files() {
            let path = dir.join(&file.path);
            let handle = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
            handle.set_len(file.size).await?;
            paths.push(path);
        }
        Ok(paths)
    }

    async fn complete(&self, task: &PullFileTask, names: &[String]) -> Result<(), PullError> {
        let _guard = self.locks.lock(&task.paste_id).await;

        let renames: Vec<(String, String)> = task
            .files
            .iter()
            .zip(names)
            .filter(|(item, name)| item.name != **name)
            .map(|(item, name)| (item.name.clone(), name.clone()))
            .collect();
        if !renames.is_empty() {
            self.consumer.apply_renames(task.paste_id, &renames).await?;
        }

        let dir = self.paste_dir(task.paste_id);
        let paths = names.iter().map(|name| dir.join(name)).collect();
        self.consumer.deliver(task.paste_id, paths).await?;

        if let Err(e) = self.tasks.clear(task.task_id).await {
            warn!("failed to clear pull state of {}: {}", task.task_id, e);
        }
        self.progress.remove(task.paste_id);
        info!("pull {} for paste {} done", task.task_id, task.paste_id);
        let _ = self.signals.send(TransferSignal::PullSucceeded {
            task_id: task.task_id,
            paste_id: task.paste_id,
        });
        Ok(())
    }

    async fn abandon(&self, task: &PullFileTask, message: &str) {
        let _guard = self.locks.lock(&task.paste_id).await;

        let dir = self.paste_dir(task.paste_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("removed partial files in {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {}", dir.display(), e),
        }
        self.consumer.invalidate(task.paste_id).await;
        self.progress.remove(task.paste_id);
        let _ = self.signals.send(TransferSignal::PullFailed {
            task_id: task.task_id,
            paste_id: task.paste_id,
            message: message.to_string(),
        });
    }
}

async fn fetch_chunk(
    api: &dyn SyncApi,
    address: &PeerAddress,
    request: &PullChunkRequest,
    chunk: &FilesChunk,
    path: &Path,
) -> Result<(), PullError> {
    let bytes = api.pull_file_chunk(address, request).await?;
    if bytes.len() as u64 != chunk.len {
        return Err(PullError::ChunkSizeMismatch {
            index: chunk.index,
            expected: chunk.len,
            actual: bytes.len() as u64,
        });
    }
    if bytes.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::transport::MockPeer;
    use std::time::Duration;
    use sync_types::{ExecutionStatus, VersionRelation};
    use tokio::sync::broadcast::error::TryRecvError;

    struct FixedLocator(Option<PeerAddress>);

    #[async_trait]
    impl PeerLocator for FixedLocator {
        async fn locate(&self, id: &InstanceId) -> Result<PeerAddress, PullError> {
            self.0
                .clone()
                .ok_or_else(|| PullError::AddressUnavailable(id.clone()))
        }
    }

    struct Setup {
        engine: ChunkTransferEngine,
        peer: MockPeer,
        tasks: Arc<MemoryTaskStore>,
        consumer: Arc<MemoryPasteConsumer>,
        _root: tempfile::TempDir,
    }

    fn remote() -> InstanceId {
        InstanceId::new("sender")
    }

    fn setup(reachable: bool, chunk_size: u64) -> Setup {
        let root = tempfile::tempdir().unwrap();
        let peer = MockPeer::new();
        peer.set_reachable(&remote(), &["10.0.0.20"], VersionRelation::EqualTo);
        let locator = FixedLocator(reachable.then(|| PeerAddress::new(remote(), "10.0.0.20", 13129)));
        let tasks = Arc::new(MemoryTaskStore::new());
        let consumer = Arc::new(MemoryPasteConsumer::new());
        let config = PullConfig {
            chunk_size,
            ..PullConfig::default()
        };
        let engine = ChunkTransferEngine::new(
            Arc::new(locator),
            Arc::new(peer.clone()),
            tasks.clone(),
            consumer.clone(),
            root.path(),
            &config,
        );
        Setup {
            engine,
            peer,
            tasks,
            consumer,
            _root: root,
        }
    }

    fn content() -> Vec<u8> {
        (0u8..20).collect()
    }

    fn serve_content(peer: &MockPeer) {
        peer.serve_chunks(&remote(), content().chunks(4).map(<[u8]>::to_vec).collect());
    }

    fn task(files: Vec<PullFileItem>) -> PullFileTask {
        PullFileTask {
            task_id: TaskId::new(),
            paste_id: PasteId::new(11),
            remote: remote(),
            files,
        }
    }

    async fn persisted(s: &Setup, task_id: TaskId) -> PullExtraInfo {
        match s
            .tasks
            .load_extra_info(task_id, TaskType::PullFile)
            .await
            .unwrap()
        {
            TaskExtraInfo::PullFile(info) => info,
            other => panic!("unexpected extra info {:?}", other),
        }
    }

    #[tokio::test]
    async fn retry_requests_only_pending_chunks() {
        let s = setup(true, 4);
        serve_content(&s.peer);
        s.peer.fail_chunk_once(&remote(), 1);
        s.peer.fail_chunk_once(&remote(), 3);
        let mut signals = s.engine.subscribe();
        let task = task(vec![PullFileItem::new("data.bin", 20)]);

        let first = s.engine.execute(&task, 1).await;
        assert!(matches!(first, TaskOutcome::NeedsRetry { .. }), "{:?}", first);
        let extra = persisted(&s, task.task_id).await;
        assert_eq!(extra.pull_chunks, vec![1, 0, 1, 0, 1]);
        assert_eq!(extra.execution_histories.len(), 1);
        assert_eq!(extra.execution_histories[0].status, ExecutionStatus::Failure);
        assert_eq!(s.engine.progress().progress(task.paste_id), Some(0.6));
        assert!(matches!(signals.try_recv(), Err(TryRecvError::Empty)));

        s.peer.clear_calls();
        let second = s.engine.execute(&task, 2).await;
        assert_eq!(second, TaskOutcome::Success);

        let mut requested = s.peer.chunk_requests(&remote());
        requested.sort_unstable();
        assert_eq!(requested, vec![1, 3]);

        assert_eq!(
            signals.try_recv().unwrap(),
            TransferSignal::PullSucceeded {
                task_id: task.task_id,
                paste_id: task.paste_id
            }
        );
        assert!(matches!(signals.try_recv(), Err(TryRecvError::Empty)));

        let path = s.engine.paste_dir(task.paste_id).join("data.bin");
        assert_eq!(std::fs::read(&path).unwrap(), content());
        assert_eq!(
            s.consumer.calls(),
            vec![ConsumerCall::Delivered(task.paste_id, vec![path])]
        );
        assert!(s.tasks.raw(task.task_id).is_none());
        assert!(s.engine.progress().get(task.paste_id).is_none());
    }

    #[tokio::test]
    async fn all_chunks_failing_are_all_reported() {
        let s = setup(true, 4);
        serve_content(&s.peer);
        for i in 0..5 {
            s.peer.fail_chunk_once(&remote(), i);
        }
        let task = task(vec![PullFileItem::new("data.bin", 20)]);

        let outcome = s.engine.execute(&task, 1).await;
        let TaskOutcome::NeedsRetry { message } = outcome else {
            panic!("expected retry, got {:?}", outcome);
        };
        assert!(message.starts_with("5 chunk(s) failed"), "{}", message);
        assert_eq!(s.peer.chunk_requests(&remote()).len(), 5);
    }

    #[tokio::test]
    async fn exhausted_budget_cleans_up_and_signals_failure() {
        let s = setup(true, 4);
        serve_content(&s.peer);
        let mut signals = s.engine.subscribe();
        let task = task(vec![PullFileItem::new("data.bin", 20)]);

        for attempt in 1..=3 {
            s.peer.fail_chunk_once(&remote(), 4);
            let outcome = s.engine.execute(&task, attempt).await;
            if attempt < 3 {
                assert!(matches!(outcome, TaskOutcome::NeedsRetry { .. }));
            } else {
                assert!(matches!(outcome, TaskOutcome::Failed { .. }));
            }
        }

        assert!(!s.engine.paste_dir(task.paste_id).exists());
        assert_eq!(
            s.consumer.calls(),
            vec![ConsumerCall::Invalidated(task.paste_id)]
        );
        assert!(matches!(
            signals.try_recv(),
            Ok(TransferSignal::PullFailed { .. })
        ));
        assert!(matches!(signals.try_recv(), Err(TryRecvError::Empty)));

        let extra = persisted(&s, task.task_id).await;
        assert!(extra.pull_chunks.is_empty());
        assert_eq!(extra.execution_histories.len(), 3);
    }

    #[tokio::test]
    async fn missing_address_counts_against_budget() {
        let s = setup(false, 4);
        let task = task(vec![PullFileItem::new("data.bin", 20)]);

        let first = s.engine.execute(&task, 1).await;
        let TaskOutcome::NeedsRetry { message } = first else {
            panic!("expected retry, got {:?}", first);
        };
        assert!(message.contains("address unavailable"));
        assert_eq!(persisted(&s, task.task_id).await.pull_chunks, vec![0; 5]);

        let last = s.engine.execute(&task, 3).await;
        assert!(matches!(last, TaskOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn chunk_count_drift_is_fatal() {
        let s = setup(true, 4);
        let task = task(vec![PullFileItem::new("data.bin", 20)]);
        s.tasks
            .save_extra_info(
                task.task_id,
                &TaskExtraInfo::PullFile(PullExtraInfo {
                    pull_chunks: vec![1, 0, 1],
                    execution_histories: Vec::new(),
                }),
            )
            .await
            .unwrap();

        let outcome = s.engine.execute(&task, 1).await;
        let TaskOutcome::Failed { message } = outcome else {
            panic!("expected fatal failure, got {:?}", outcome);
        };
        assert!(message.contains("chunk count mismatch"));
        assert!(s.peer.chunk_requests(&remote()).is_empty());
    }

    #[tokio::test]
    async fn short_chunk_is_rejected() {
        let s = setup(true, 4);
        s.peer.serve_chunks(&remote(), vec![vec![1, 2, 3]]);
        let task = task(vec![PullFileItem::new("tiny.bin", 4)]);

        let outcome = s.engine.execute(&task, 1).await;
        let TaskOutcome::NeedsRetry { message } = outcome else {
            panic!("expected retry, got {:?}", outcome);
        };
        assert!(message.contains("has 3 bytes, expected 4"), "{}", message);
    }

    #[tokio::test]
    async fn conflicting_names_are_renamed_before_delivery() {
        let s = setup(true, 1024);
        s.peer.serve_chunks(
            &remote(),
            vec![b"one".to_vec(), b"two".to_vec(), Vec::new()],
        );
        let task = task(vec![
            PullFileItem::new("report.pdf", 3),
            PullFileItem::new("docs/report.pdf", 3),
            PullFileItem::new("empty", 0),
        ]);

        assert_eq!(s.engine.execute(&task, 1).await, TaskOutcome::Success);

        let dir = s.engine.paste_dir(task.paste_id);
        assert_eq!(std::fs::read(dir.join("report.pdf")).unwrap(), b"one");
        assert_eq!(std::fs::read(dir.join("report(1).pdf")).unwrap(), b"two");
        assert_eq!(std::fs::read(dir.join("empty")).unwrap(), b"");
        assert_eq!(
            s.consumer.calls()[0],
            ConsumerCall::Renamed(
                task.paste_id,
                vec![("docs/report.pdf".to_string(), "report(1).pdf".to_string())]
            )
        );
    }

    #[tokio::test]
    async fn cancelled_attempt_keeps_finished_chunks() {
        let s = setup(true, 4);
        serve_content(&s.peer);
        s.peer.stall_chunk(&remote(), 2);
        let mut signals = s.engine.subscribe();
        let task = task(vec![PullFileItem::new("data.bin", 20)]);
        let cancel = CancellationToken::new();

        let (outcome, ()) = tokio::join!(
            s.engine.execute_cancellable(&task, 1, &cancel),
            async {
                while s.engine.progress().progress(task.paste_id) != Some(0.8) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                cancel.cancel();
            }
        );

        assert_eq!(outcome, TaskOutcome::Cancelled);
        let extra = persisted(&s, task.task_id).await;
        assert_eq!(extra.pull_chunks, vec![1, 1, 0, 1, 1]);
        assert!(extra.execution_histories.is_empty());
        assert!(s.engine.progress().get(task.paste_id).is_none());
        assert!(s.consumer.calls().is_empty());
        assert!(matches!(signals.try_recv(), Err(TryRecvError::Empty)));
        assert!(s.engine.paste_dir(task.paste_id).join("data.bin").exists());
    }

    #[tokio::test]
    async fn cancel_before_start_requests_nothing() {
        let s = setup(true, 4);
        serve_content(&s.peer);
        let task = task(vec![PullFileItem::new("data.bin", 20)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = s.engine.execute_cancellable(&task, 1, &cancel).await;
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(s.peer.chunk_requests(&remote()).is_empty());
        assert_eq!(persisted(&s, task.task_id).await.pull_chunks, vec![0; 5]);
    }

    #[tokio::test]
    async fn dropped_attempt_stops_tracking_progress() {
        let s = setup(true, 4);
        serve_content(&s.peer);
        s.peer.stall_chunk(&remote(), 0);
        let task = task(vec![PullFileItem::new("data.bin", 20)]);

        let result =
            tokio::time::timeout(Duration::from_millis(50), s.engine.execute(&task, 1)).await;
        assert!(result.is_err());
        assert!(s.engine.progress().get(task.paste_id).is_none());
    }

    #[test]
    fn name_resolution_is_deterministic() {
        let items = vec![
            PullFileItem::new("a.txt", 1),
            PullFileItem::new("a.txt", 1),
            PullFileItem::new("a(1).txt", 1),
            PullFileItem::new(".env", 1),
            PullFileItem::new(".env", 1),
            PullFileItem::new("Makefile", 1),
            PullFileItem::new("Makefile", 1),
        ];
        let names = resolve_names(&items);
        assert_eq!(
            names,
            vec!["a.txt", "a(1).txt", "a(1)(1).txt", ".env", ".env(1)", "Makefile", "Makefile(1)"]
        );
        assert_eq!(resolve_names(&items), names);
    }
}
