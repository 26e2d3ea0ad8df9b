//! Caller-supplied processing functions

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use super::segments::SegmentError;
use crate::persistence::StoreError;

/// Failure raised while processing a task
///
/// Transient failures of a blob task are retried up to the retry ceiling.
/// Terminal failures, and any failure of a whole-payload task, are recorded
/// on the task row straight away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("{message}")]
    Transient {
        message: String,
        trace: Option<String>,
    },

    #[error("{message}")]
    Terminal {
        message: String,
        trace: Option<String>,
    },
}

impl ProcessingError {
    /// Create a retryable error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            trace: None,
        }
    }

    /// Create a non-retryable error
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
            trace: None,
        }
    }

    /// Attach a stack trace or error chain
    pub fn with_trace(mut self, new_trace: impl Into<String>) -> Self {
        match &mut self {
            Self::Transient { trace, .. } | Self::Terminal { trace, .. } => {
                *trace = Some(new_trace.into());
            }
        }
        self
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Terminal { message, .. } => message,
        }
    }

    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Transient { trace, .. } | Self::Terminal { trace, .. } => trace.as_deref(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<anyhow::Error> for ProcessingError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err.to_string()).with_trace(format!("{err:?}"))
    }
}

impl From<SegmentError> for ProcessingError {
    fn from(err: SegmentError) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<StoreError> for ProcessingError {
    fn from(err: StoreError) -> Self {
        Self::transient(err.to_string())
    }
}

/// Processes the payload of a whole-payload task
///
/// Implemented for any `Fn(Value) -> impl Future<Output = Result<Value, ProcessingError>>`.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    async fn process(&self, payload: Value) -> Result<Value, ProcessingError>;
}

#[async_trait]
impl<F, Fut> RequestProcessor for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessingError>> + Send + 'static,
{
    async fn process(&self, payload: Value) -> Result<Value, ProcessingError> {
        (self)(payload).await
    }
}

/// Processes one batch of records of a blob task
///
/// Returns one output value per produced result; each value becomes one line
/// of the task's output blob.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    async fn process_batch(
        &self,
        batch: Vec<String>,
        parameters: Option<Value>,
    ) -> Result<Vec<Value>, ProcessingError>;
}

#[async_trait]
impl<F, Fut> BatchProcessor for F
where
    F: Fn(Vec<String>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Value>, ProcessingError>> + Send + 'static,
{
    async fn process_batch(
        &self,
        batch: Vec<String>,
        parameters: Option<Value>,
    ) -> Result<Vec<Value>, ProcessingError> {
        (self)(batch, parameters).await
    }
}
