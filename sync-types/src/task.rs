//! Retry metadata persisted alongside background tasks.
//!
//! The task framework stores one JSON blob of "extra info" per task. Which
//! shape that blob has is decided by the task's type tag, so decoding is an
//! explicit `(TaskType, &str) -> TaskExtraInfo` step rather than a
//! self-describing format.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SyncError;

/// Kind of background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Chunked, resumable pull of a paste's files from a peer.
    PullFile,
    /// Pull of an application icon from a peer.
    PullIcon,
}

impl TaskType {
    /// Total attempts (first run included) before the task is given up.
    ///
    /// Budgets are per task type; there is no shared rule behind them.
    pub fn max_attempts(self) -> u32 {
        match self {
            Self::PullFile => 3,
            Self::PullIcon => 2,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PullFile => f.write_str("PULL_FILE"),
            Self::PullIcon => f.write_str("PULL_ICON"),
        }
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// The attempt completed.
    Success,
    /// The attempt failed.
    Failure,
}

/// One attempt in a task's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHistory {
    /// Unix millis when the attempt started.
    pub start_time: u64,
    /// Unix millis when the attempt ended.
    pub end_time: u64,
    /// How it ended.
    pub status: ExecutionStatus,
    /// Failure description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionHistory {
    /// Record a failed attempt.
    pub fn failure(start_time: u64, end_time: u64, message: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            status: ExecutionStatus::Failure,
            message: Some(message.into()),
        }
    }
}

/// Extra info for tasks that only keep a history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseExtraInfo {
    /// Previous attempts, oldest first.
    #[serde(default)]
    pub execution_histories: Vec<ExecutionHistory>,
}

/// Extra info for chunked file pulls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullExtraInfo {
    /// Completion bitmap, one entry per chunk: 0 = pending, 1 = done.
    /// Empty until the first attempt has built the chunk index.
    #[serde(default)]
    pub pull_chunks: Vec<u8>,
    /// Previous attempts, oldest first.
    #[serde(default)]
    pub execution_histories: Vec<ExecutionHistory>,
}

/// Extra info of a task, tagged by task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExtraInfo {
    /// File pull metadata.
    PullFile(PullExtraInfo),
    /// Icon pull metadata.
    PullIcon(BaseExtraInfo),
}

impl TaskExtraInfo {
    /// Empty extra info for a task that has never run.
    pub fn empty(task_type: TaskType) -> Self {
        match task_type {
            TaskType::PullFile => Self::PullFile(PullExtraInfo::default()),
            TaskType::PullIcon => Self::PullIcon(BaseExtraInfo::default()),
        }
    }

    /// The task type this extra info belongs to.
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::PullFile(_) => TaskType::PullFile,
            Self::PullIcon(_) => TaskType::PullIcon,
        }
    }

    /// Encode to the persisted JSON form (the tag is stored separately).
    pub fn encode(&self) -> Result<String, SyncError> {
        let json = match self {
            Self::PullFile(info) => serde_json::to_string(info)?,
            Self::PullIcon(info) => serde_json::to_string(info)?,
        };
        Ok(json)
    }

    /// Decode persisted JSON using the task type as the tag.
    ///
    /// An empty blob decodes to empty extra info.
    pub fn decode(task_type: TaskType, json: &str) -> Result<Self, SyncError> {
        if json.trim().is_empty() {
            return Ok(Self::empty(task_type));
        }
        let info = match task_type {
            TaskType::PullFile => Self::PullFile(serde_json::from_str(json)?),
            TaskType::PullIcon => Self::PullIcon(serde_json::from_str(json)?),
        };
        Ok(info)
    }

    /// Previous attempts, oldest first.
    pub fn execution_histories(&self) -> &[ExecutionHistory] {
        match self {
            Self::PullFile(info) => &info.execution_histories,
            Self::PullIcon(info) => &info.execution_histories,
        }
    }

    /// Append an attempt to the history.
    pub fn push_history(&mut self, history: ExecutionHistory) {
        match self {
            Self::PullFile(info) => info.execution_histories.push(history),
            Self::PullIcon(info) => info.execution_histories.push(history),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budgets_per_task_type() {
        assert_eq!(TaskType::PullFile.max_attempts(), 3);
        assert_eq!(TaskType::PullIcon.max_attempts(), 2);
    }

    #[test]
    fn pull_extra_info_uses_persisted_field_names() {
        let mut extra = TaskExtraInfo::PullFile(PullExtraInfo {
            pull_chunks: vec![0, 1, 1, 0],
            execution_histories: vec![],
        });
        extra.push_history(ExecutionHistory::failure(10, 20, "chunk 0 failed"));

        let json = extra.encode().unwrap();
        assert!(json.contains("\"pullChunks\":[0,1,1,0]"));
        assert!(json.contains("\"executionHistories\":[{"));
        assert!(json.contains("\"startTime\":10"));
        assert!(json.contains("\"status\":\"FAILURE\""));
        assert!(json.contains("\"message\":\"chunk 0 failed\""));
    }

    #[test]
    fn decode_selects_shape_by_tag() {
        let json = r#"{"pullChunks":[1,0,1],"executionHistories":[]}"#;
        let extra = TaskExtraInfo::decode(TaskType::PullFile, json).unwrap();
        match extra {
            TaskExtraInfo::PullFile(info) => assert_eq!(info.pull_chunks, vec![1, 0, 1]),
            other => panic!("expected PullFile, got {:?}", other),
        }

        let icon = TaskExtraInfo::decode(TaskType::PullIcon, r#"{"executionHistories":[]}"#)
            .unwrap();
        assert_eq!(icon.task_type(), TaskType::PullIcon);
    }

    #[test]
    fn decode_empty_blob_is_empty_info() {
        let extra = TaskExtraInfo::decode(TaskType::PullFile, "").unwrap();
        assert_eq!(extra, TaskExtraInfo::empty(TaskType::PullFile));
    }

    #[test]
    fn decode_garbage_fails() {
        let result = TaskExtraInfo::decode(TaskType::PullFile, "{not json");
        assert!(matches!(result, Err(SyncError::Json(_))));
    }
}
