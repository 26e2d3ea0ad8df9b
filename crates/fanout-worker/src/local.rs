// Local end-to-end runner
//
// Wires the orchestrator and a queue worker to the in-memory backends and
// drains until the triggered task finishes. Retries and polls fire without
// delay so a whole fan-out completes inside one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;

use fanout_durable::engine::{
    OrchestratorConfig, ProcessingError, TaskId, TaskOrchestrator, TaskResult,
};
use fanout_durable::persistence::{
    InMemoryBlobStore, InMemoryEntityStore, InMemoryQueue, INPUT_CONTAINER, OUTPUT_CONTAINER,
};
use fanout_durable::reliability::{PollPolicy, RetryPolicy};
use fanout_durable::worker::{QueueWorker, QueueWorkerConfig};

/// Upper bound on drains before a task is considered stuck
const MAX_DRAINS: usize = 64;

/// Per-record transformation applied by the local batch processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transform {
    /// Emit each record unchanged
    Identity,
    /// Emit each record in upper case
    Uppercase,
    /// Emit the character count of each record
    Length,
}

impl Transform {
    pub fn apply(self, record: &str) -> Value {
        match self {
            Transform::Identity => Value::String(record.to_string()),
            Transform::Uppercase => Value::String(record.to_uppercase()),
            Transform::Length => Value::from(record.chars().count()),
        }
    }
}

/// Output of a local blob run
#[derive(Debug)]
pub struct BlobRun {
    pub task_id: TaskId,
    pub result: TaskResult,
    /// Merged output, absent when the task failed
    pub output: Option<Vec<u8>>,
}

pub struct LocalRunner {
    blobs: Arc<InMemoryBlobStore>,
    orchestrator: Arc<TaskOrchestrator>,
    worker: QueueWorker,
}

impl LocalRunner {
    pub fn new(config: OrchestratorConfig, chunk_size: Option<usize>) -> Result<Self> {
        let store = Arc::new(InMemoryEntityStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let blobs = Arc::new(match chunk_size {
            Some(size) => InMemoryBlobStore::with_chunk_size(size),
            None => InMemoryBlobStore::new(),
        });

        let max_attempts = config.retry_policy.max_attempts;
        let config = config
            .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, max_attempts))
            .with_poll_policy(PollPolicy::immediate());
        let orchestrator = Arc::new(
            TaskOrchestrator::new(store, queue.clone(), blobs.clone(), config)
                .context("invalid orchestrator configuration")?,
        );
        let worker = QueueWorker::new(orchestrator.clone(), queue, QueueWorkerConfig::default());

        Ok(Self {
            blobs,
            orchestrator,
            worker,
        })
    }

    /// Upload `content` as a blob, run it through `transform` and collect the merged output
    pub async fn run_blob(
        &self,
        blob_name: &str,
        content: Vec<u8>,
        transform: Transform,
        parameters: Option<&Value>,
    ) -> Result<BlobRun> {
        self.blobs.put(INPUT_CONTAINER, blob_name, content);
        let task_id = self.orchestrator.trigger_blob(blob_name, parameters).await?;

        let batch = move |records: Vec<String>, _parameters: Option<Value>| async move {
            Ok::<_, ProcessingError>(records.iter().map(|r| transform.apply(r)).collect())
        };
        let result = self.drive(&task_id, Some(&batch)).await?;

        let output = match &result.result {
            Some(descriptor) if !result.is_failed() => descriptor["blob"]
                .as_str()
                .and_then(|name| self.blobs.get(OUTPUT_CONTAINER, name)),
            _ => None,
        };

        Ok(BlobRun {
            task_id,
            result,
            output,
        })
    }

    /// Run a whole-payload task that echoes its payload
    pub async fn run_payload(&self, payload: &Value) -> Result<TaskResult> {
        let task_id = self.orchestrator.trigger(payload).await?;
        self.drive(&task_id, None).await
    }

    async fn drive(
        &self,
        task_id: &TaskId,
        batch: Option<&dyn fanout_durable::BatchProcessor>,
    ) -> Result<TaskResult> {
        let echo = |payload: Value| async move { Ok::<_, ProcessingError>(payload) };

        for _ in 0..MAX_DRAINS {
            let report = self.worker.drain(&echo, batch).await?;
            tracing::debug!(
                processed = report.processed,
                dead_lettered = report.dead_lettered,
                "drain finished"
            );

            let result = self.orchestrator.get_result(task_id).await?;
            if result.is_completed() {
                return Ok(result);
            }
            if !report.found_work() {
                bail!("queue drained but task {task_id} never completed");
            }
        }
        bail!("task {task_id} did not complete after {MAX_DRAINS} drains")
    }
}
