//! Client-facing view of a task row

use serde_json::{json, Value};

use super::record::TaskRecord;

/// Read-only projection of a task for clients polling on its completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResult {
    pub result: Option<Value>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub progress: Option<u64>,
}

impl TaskResult {
    /// Project a task row
    pub fn from_record(record: &TaskRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            result: record
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: record.error.clone(),
            stack_trace: record.stack_trace.clone(),
            progress: record.progress,
        })
    }

    /// True once the task has either a result or an error
    pub fn is_completed(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// `{"Completed": bool}` plus `Result`, `Error`/`StackTrace` and `Progress` when present
    pub fn to_json(&self) -> Value {
        let mut response = json!({ "Completed": self.is_completed() });
        if let Some(result) = &self.result {
            response["Result"] = result.clone();
        }
        if let Some(error) = &self.error {
            response["Error"] = json!(error);
            response["StackTrace"] = json!(self.stack_trace);
        }
        if let Some(progress) = self.progress {
            response["Progress"] = json!(progress);
        }
        response
    }
}
