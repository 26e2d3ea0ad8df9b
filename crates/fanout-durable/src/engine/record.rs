//! Typed rows stored in the table store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing state of a task row
///
/// An absent state means the task has not been processed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Parent waiting on its child tasks
    Polling,
    /// Finished successfully
    Completed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polling => write!(f, "Polling"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Task metadata row, keyed by `(group id, content hash)`
///
/// Exactly one of these holds at any time: success (`result` set and state
/// `Completed`), failure (`error` set), or still running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskRecord {
    /// Serialized payload of a whole-payload task
    #[serde(rename = "Request", default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,

    /// Input blob of a blob task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_name: Option<String>,

    /// Serialized parameters forwarded to the batch processor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,

    /// Serialized output, set on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,

    /// Records processed so far by the children of a parent task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u64>,

    /// Partition holding the child task rows of a parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_tasks_partition: Option<String>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,

    /// Unsuccessful poll passes of a parent
    #[serde(default, skip_serializing_if = "is_zero")]
    pub poll_count: u32,
}

impl TaskRecord {
    /// Row for a whole-payload task
    pub fn for_request(request_body: String) -> Self {
        Self {
            request_body: Some(request_body),
            ..Default::default()
        }
    }

    /// Row for a blob task
    pub fn for_blob(blob_name: impl Into<String>, parameters: Option<String>) -> Self {
        Self {
            blob_name: Some(blob_name.into()),
            parameters,
            ..Default::default()
        }
    }

    /// Whether the task succeeded or failed for good
    pub fn is_terminal(&self) -> bool {
        self.error.is_some() || self.state == Some(TaskState::Completed)
    }

    /// Whether the task has been split into child tasks
    pub fn is_parent(&self) -> bool {
        self.child_tasks_partition.is_some()
    }

    /// Deserialized parameters, if any
    pub fn parameters_value(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        self.parameters
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }
}

/// Row in the failure log, keyed by `(worker name, task id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailureRecord {
    pub failure_message: String,
    pub stack_trace: String,
}

/// Singleton row shared by all workers draining one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerStateRecord {
    pub active_count: u32,
    pub max_count: u32,
    pub update_date: DateTime<Utc>,
}
