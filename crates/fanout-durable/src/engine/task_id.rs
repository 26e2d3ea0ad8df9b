//! Task identifiers
//!
//! A task id is `"{partition_key}_{row_key}"`. The partition key is a fresh
//! UUID in simple (hex) form, the row key a SHA-256 hex digest of the task
//! content, so neither half ever contains the `_` separator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Separator between the partition and row halves of a task id
pub const TASK_ID_SEPARATOR: char = '_';

/// Error parsing or building a task id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskIdError {
    /// Not of the form `<partition>_<row>`
    #[error("malformed task id '{0}': expected '<partition>_<row>'")]
    Malformed(String),

    /// A key half is empty or contains the separator
    #[error("invalid task key '{0}': keys must be non-empty and must not contain '_'")]
    InvalidKey(String),
}

/// Identifier of a task row: partition key plus row key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    partition_key: String,
    row_key: String,
}

impl TaskId {
    /// Build a task id from its halves
    pub fn new(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Result<Self, TaskIdError> {
        let partition_key = partition_key.into();
        let row_key = row_key.into();
        for key in [&partition_key, &row_key] {
            if key.is_empty() || key.contains(TASK_ID_SEPARATOR) {
                return Err(TaskIdError::InvalidKey(key.clone()));
            }
        }
        Ok(Self {
            partition_key,
            row_key,
        })
    }

    /// Fresh id for `content`: random partition, content-hash row
    pub fn generate(content: &str) -> Self {
        Self::in_partition(new_partition_key(), content)
    }

    /// Id for `content` inside an existing partition
    pub(crate) fn in_partition(partition_key: String, content: &str) -> Self {
        Self {
            partition_key,
            row_key: content_hash(content),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.partition_key, TASK_ID_SEPARATOR, self.row_key
        )
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (partition_key, row_key) = s
            .split_once(TASK_ID_SEPARATOR)
            .ok_or_else(|| TaskIdError::Malformed(s.to_string()))?;
        if row_key.contains(TASK_ID_SEPARATOR) {
            return Err(TaskIdError::Malformed(s.to_string()));
        }
        Self::new(partition_key, row_key).map_err(|_| TaskIdError::Malformed(s.to_string()))
    }
}

impl TryFrom<String> for TaskId {
    type Error = TaskIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

/// A fresh random partition key
pub fn new_partition_key() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Lowercase hex SHA-256 of `content`
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
