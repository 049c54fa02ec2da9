//! Application icon pull.
//!
//! Icons of one source share a destination, so every write is staged next
//! to it and renamed into place under the source's lock stripe. A failed
//! attempt only ever removes its own staging file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use sync_types::{ExecutionHistory, InstanceId, PullIconRequest, TaskExtraInfo, TaskId, TaskType};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::PullConfig;
use crate::error::PullError;
use crate::lock::StripedLock;
use crate::orchestrator::PeerLocator;
use crate::pull::{TaskOutcome, TransferSignal};
use crate::store::{now_millis, TaskStore};
use crate::transport::SyncApi;

/// An icon pull task.
#[derive(Debug, Clone)]
pub struct PullIconTask {
    /// Task id.
    pub task_id: TaskId,
    /// Device serving the icon.
    pub remote: InstanceId,
    /// Which application's icon (the sender's app identifier).
    pub source: String,
    /// Where to write it.
    pub dest: PathBuf,
}

impl PullIconTask {
    /// Where this task stages its bytes before the rename.
    pub fn staging_path(&self) -> PathBuf {
        let name = self
            .dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "icon".to_string());
        self.dest.with_file_name(format!(".{}.{}.part", name, self.task_id))
    }
}

/// Executes icon pull attempts.
pub struct IconPuller {
    locator: Arc<dyn PeerLocator>,
    api: Arc<dyn SyncApi>,
    tasks: Arc<dyn TaskStore>,
    locks: StripedLock,
    signals: broadcast::Sender<TransferSignal>,
}

impl IconPuller {
    /// Create a puller reporting on `signals`.
    pub fn new(
        locator: Arc<dyn PeerLocator>,
        api: Arc<dyn SyncApi>,
        tasks: Arc<dyn TaskStore>,
        signals: broadcast::Sender<TransferSignal>,
        config: &PullConfig,
    ) -> Self {
        Self {
            locator,
            api,
            tasks,
            locks: StripedLock::new(config.lock_stripes),
            signals,
        }
    }

    /// Run one attempt (1-based) of `task`.
    pub async fn execute(&self, task: &PullIconTask, attempt: u32) -> TaskOutcome {
        let start_time = now_millis();
        let message = match self.pull(task).await {
            Ok(()) => {
                if let Err(e) = self.tasks.clear(task.task_id).await {
                    warn!("failed to clear icon task {}: {}", task.task_id, e);
                }
                debug!("icon {} written to {}", task.source, task.dest.display());
                let _ = self.signals.send(TransferSignal::IconPulled {
                    task_id: task.task_id,
                });
                return TaskOutcome::Success;
            }
            Err(e) => e.to_string(),
        };

        let history = ExecutionHistory::failure(start_time, now_millis(), message.clone());
        self.record_failure(task.task_id, history).await;

        if attempt < TaskType::PullIcon.max_attempts() {
            debug!("icon pull {} will retry: {}", task.task_id, message);
            return TaskOutcome::NeedsRetry { message };
        }

        warn!("icon pull {} failed for good: {}", task.task_id, message);
        {
            let _guard = self.locks.lock(task.source.as_str()).await;
            remove_staging(&task.staging_path()).await;
        }
        let _ = self.signals.send(TransferSignal::IconFailed {
            task_id: task.task_id,
            message: message.clone(),
        });
        TaskOutcome::Failed { message }
    }

    /// Append `history` to the task's stored histories. Nothing is written
    /// when the stored record cannot be read, so earlier entries survive.
    async fn record_failure(&self, task_id: TaskId, history: ExecutionHistory) {
        let mut extra = match self.tasks.load_extra_info(task_id, TaskType::PullIcon).await {
            Ok(extra @ TaskExtraInfo::PullIcon(_)) => extra,
            Ok(other) => {
                warn!(
                    "icon task {} holds {} extra info, history not updated",
                    task_id,
                    other.task_type()
                );
                return;
            }
            Err(e) => {
                warn!("failed to load icon task {}, history not updated: {}", task_id, e);
                return;
            }
        };
        extra.push_history(history);
        if let Err(e) = self.tasks.save_extra_info(task_id, &extra).await {
            error!("failed to persist icon task {}: {}", task_id, e);
        }
    }

    async fn pull(&self, task: &PullIconTask) -> Result<(), PullError> {
        let address = self.locator.locate(&task.remote).await?;
        let request = PullIconRequest {
            source: task.source.clone(),
        };
        let bytes = self.api.pull_icon(&address, &request).await?;

        let _guard = self.locks.lock(task.source.as_str()).await;
        let staging = task.staging_path();
        let installed = install(&bytes, &staging, &task.dest).await;
        if installed.is_err() {
            remove_staging(&staging).await;
        }
        installed
    }
}

async fn install(bytes: &[u8], staging: &Path, dest: &Path) -> Result<(), PullError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(staging, bytes).await?;
    tokio::fs::rename(staging, dest).await?;
    Ok(())
}

async fn remove_staging(staging: &Path) {
    match tokio::fs::remove_file(staging).await {
        Ok(()) => debug!("removed {}", staging.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {}", staging.display(), e),
    }
}
