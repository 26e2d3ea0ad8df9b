//! Task orchestrator
//!
//! The `TaskOrchestrator` is responsible for:
//! - Registering new tasks (whole payloads or blob references)
//! - Driving a dequeued task through its state machine
//! - Splitting oversized blobs into child tasks and merging their outputs
//! - Turning processing failures into persisted task state

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::persistence::{
    encode_message, BatchOperation, BlobStore, DurableQueue, Entity, EntityStore, StoreError,
    INPUT_CONTAINER, MAX_BATCH_OPERATIONS, OUTPUT_CONTAINER,
};

use super::config::{ConfigError, OrchestratorConfig};
use super::processor::{BatchProcessor, ProcessingError, RequestProcessor};
use super::record::{FailureRecord, TaskRecord, TaskState};
use super::result::TaskResult;
use super::segments::{encode_record, SegmentReader};
use super::task_id::{new_partition_key, TaskId, TaskIdError};

/// Body of the signal sent to the wake-up queue when a task is registered
pub const WAKE_UP_MESSAGE: &str = "wake up";

/// Errors from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No metadata row exists for the task id
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Task id could not be parsed
    #[error("invalid task id: {0}")]
    InvalidTaskId(#[from] TaskIdError),

    /// Whole-payload processing failed and no failure log is configured
    #[error("task {task_id} failed: {source}")]
    Processing {
        task_id: TaskId,
        #[source]
        source: ProcessingError,
    },

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// What a single `process_message` call did
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Task finished successfully in this pass
    Completed,

    /// Task reached terminal failure in this pass
    Failed,

    /// Blob was split into child tasks; the parent now polls them
    Split { children: usize },

    /// Parent polled its children and some are still running
    Polling { completed: usize, total: usize },

    /// Transient blob failure; the task was re-enqueued
    RetryScheduled { retry_count: u32, delay: Duration },

    /// Task was already terminal (redelivered message)
    AlreadyCompleted,

    /// Another worker updated the row first; this pass was abandoned
    Superseded,

    /// Row has neither a request body nor a blob name
    Empty,
}

impl ProcessOutcome {
    /// Whether the task is finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::AlreadyCompleted
        )
    }
}

/// A task row as loaded from the store
struct TaskRow {
    entity: Entity,
    record: TaskRecord,
}

/// How the first pass over a blob ended
enum FirstPass {
    /// The whole blob fit within the segment limit
    Whole(Vec<Value>),

    /// The segment limit was reached with records left over
    Split {
        results: Vec<Value>,
        reader: SegmentReader,
    },
}

/// Drives tasks through segmentation, fan-out, polling and merge
///
/// All state lives in the collaborators, so any number of orchestrators on
/// any number of machines may share the same store and queue.
///
/// # Example
///
/// ```ignore
/// use fanout_durable::prelude::*;
///
/// let orchestrator = TaskOrchestrator::new(store, queue, blobs, OrchestratorConfig::default())?;
///
/// let task_id = orchestrator.trigger(&json!({"x": 1})).await?;
/// orchestrator
///     .process_message(&task_id, &|payload: Value| async move { Ok(payload) }, None)
///     .await?;
///
/// let result = orchestrator.get_result(&task_id).await?;
/// assert!(result.is_completed());
/// ```
pub struct TaskOrchestrator {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn DurableQueue>,
    blobs: Arc<dyn BlobStore>,
    wake_up_queue: Option<Arc<dyn DurableQueue>>,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    /// Create an orchestrator over the given collaborators
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn DurableQueue>,
        blobs: Arc<dyn BlobStore>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self {
            store,
            queue,
            blobs,
            wake_up_queue: None,
            config,
        })
    }

    /// Signal `queue` every time a task is registered
    pub fn with_wake_up_queue(mut self, queue: Arc<dyn DurableQueue>) -> Self {
        self.wake_up_queue = Some(queue);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a whole-payload task and enqueue it
    ///
    /// Identical payloads get distinct task ids.
    #[instrument(skip_all)]
    pub async fn trigger<T: Serialize + ?Sized>(
        &self,
        payload: &T,
    ) -> Result<TaskId, OrchestratorError> {
        let body = serde_json::to_string(payload)?;
        let task_id = TaskId::generate(&body);
        self.register(&task_id, &TaskRecord::for_request(body)).await?;

        info!(%task_id, "registered task");
        Ok(task_id)
    }

    /// Register a blob task and enqueue it
    #[instrument(skip(self, parameters))]
    pub async fn trigger_blob(
        &self,
        blob_name: &str,
        parameters: Option<&Value>,
    ) -> Result<TaskId, OrchestratorError> {
        let parameters = parameters.map(serde_json::to_string).transpose()?;
        let task_id = TaskId::generate(blob_name);
        self.register(&task_id, &TaskRecord::for_blob(blob_name, parameters))
            .await?;

        info!(%task_id, "registered blob task");
        Ok(task_id)
    }

    async fn register(&self, task_id: &TaskId, record: &TaskRecord) -> Result<(), OrchestratorError> {
        let entity = Entity::from_record(task_id.partition_key(), task_id.row_key(), record)?;
        self.store
            .insert(&self.config.metadata_table, entity)
            .await?;
        self.enqueue(task_id, Duration::ZERO).await?;

        if let Some(wake_up) = &self.wake_up_queue {
            wake_up.enqueue(&encode_message(WAKE_UP_MESSAGE)).await?;
            debug!(%task_id, "sent wake-up signal");
        }
        Ok(())
    }

    /// Process one dequeued task id
    ///
    /// A missing row is an error. Task-level failures become persisted state;
    /// only an unlogged whole-payload failure is returned as
    /// [`OrchestratorError::Processing`].
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn process_message(
        &self,
        task_id: &TaskId,
        processor: &dyn RequestProcessor,
        batch_processor: Option<&dyn BatchProcessor>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let mut row = self.load(task_id).await?;
        let mut outcome = ProcessOutcome::Empty;

        if row.record.request_body.is_some() {
            outcome = self.process_request(task_id, &mut row, processor).await?;
            if matches!(outcome, ProcessOutcome::Failed | ProcessOutcome::Superseded) {
                return Ok(outcome);
            }
        }

        if row.record.blob_name.is_some() {
            outcome = match batch_processor {
                Some(batch_processor) => {
                    self.process_blob(task_id, &mut row, batch_processor)
                        .await?
                }
                None => {
                    let err = ProcessingError::terminal("blob task received without a batch processor");
                    self.fail_terminally(task_id, &mut row, &err).await?
                }
            };
        }

        if outcome == ProcessOutcome::Empty {
            warn!("task row has neither a request body nor a blob name");
        }
        Ok(outcome)
    }

    /// Read the client-facing view of a task
    pub async fn get_result(&self, task_id: &TaskId) -> Result<TaskResult, OrchestratorError> {
        let row = self.load(task_id).await?;
        Ok(TaskResult::from_record(&row.record)?)
    }

    async fn process_request(
        &self,
        task_id: &TaskId,
        row: &mut TaskRow,
        processor: &dyn RequestProcessor,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        if row.record.result.is_some() || row.record.error.is_some() {
            debug!("request already processed, skipping");
            return Ok(ProcessOutcome::AlreadyCompleted);
        }

        let body = row.record.request_body.as_deref().unwrap_or("null");
        let response = match serde_json::from_str::<Value>(body) {
            Ok(payload) => processor.process(payload).await,
            Err(e) => Err(ProcessingError::terminal(format!("invalid request body: {e}"))),
        };

        match response {
            Ok(value) => {
                row.record.result = Some(serde_json::to_string(&value)?);
                if row.record.blob_name.is_none() {
                    row.record.state = Some(TaskState::Completed);
                }
                if !self.save(row).await? {
                    return Ok(ProcessOutcome::Superseded);
                }
                info!("task completed");
                Ok(ProcessOutcome::Completed)
            }
            Err(err) => {
                error!(error = %err, "request processing failed");
                if !self.write_failure(row, &err).await? {
                    return Ok(ProcessOutcome::Superseded);
                }
                if self.config.record_failures {
                    self.append_failure_log(task_id, &err).await?;
                    Ok(ProcessOutcome::Failed)
                } else {
                    Err(OrchestratorError::Processing {
                        task_id: task_id.clone(),
                        source: err,
                    })
                }
            }
        }
    }

    async fn process_blob(
        &self,
        task_id: &TaskId,
        row: &mut TaskRow,
        batch_processor: &dyn BatchProcessor,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        if row.record.is_terminal() {
            debug!("blob task already terminal, skipping");
            return Ok(ProcessOutcome::AlreadyCompleted);
        }
        let blob_name = row.record.blob_name.clone().unwrap_or_default();

        if let Some(partition) = row.record.child_tasks_partition.clone() {
            return self
                .poll_children(task_id, row, &blob_name, &partition)
                .await;
        }

        let parameters = match row.record.parameters_value() {
            Ok(parameters) => parameters,
            Err(e) => {
                let err = ProcessingError::terminal(format!("invalid task parameters: {e}"));
                return self.fail_terminally(task_id, row, &err).await;
            }
        };

        let pass = self
            .read_first_segment(&blob_name, parameters, batch_processor)
            .await;

        match pass {
            Ok(FirstPass::Whole(results)) => {
                let output = self.output_name(&blob_name);
                if let Err(err) = self.upload_results(&output, &results).await {
                    return self.handle_blob_failure(task_id, row, err).await;
                }
                if !self.complete(row, &output).await? {
                    return Ok(ProcessOutcome::Superseded);
                }
                info!(records = results.len(), %output, "blob task completed");
                Ok(ProcessOutcome::Completed)
            }
            Ok(FirstPass::Split { results, reader }) => {
                let split = self
                    .split_into_children(&blob_name, &results, reader, row.record.parameters.as_deref())
                    .await;
                let (partition, children) = match split {
                    Ok(split) => split,
                    Err(err) => return self.handle_blob_failure(task_id, row, err).await,
                };

                row.record.child_tasks_partition = Some(partition.clone());
                row.record.state = Some(TaskState::Polling);
                if !self.save(row).await? {
                    return Ok(ProcessOutcome::Superseded);
                }
                self.enqueue(task_id, self.config.poll_policy.delay_for_poll(0))
                    .await?;

                info!(%partition, children, "blob split into child tasks");
                Ok(ProcessOutcome::Split { children })
            }
            Err(err) => self.handle_blob_failure(task_id, row, err).await,
        }
    }

    /// Read and process records until the blob ends or the segment limit is reached
    async fn read_first_segment(
        &self,
        blob_name: &str,
        parameters: Option<Value>,
        batch_processor: &dyn BatchProcessor,
    ) -> Result<FirstPass, ProcessingError> {
        let chunks = self
            .blobs
            .download_chunks(INPUT_CONTAINER, blob_name)
            .await?;
        let mut reader = SegmentReader::new(chunks);
        let batch_size = self.config.batch_size;

        let mut results = Vec::new();
        let mut batch = Vec::with_capacity(batch_size);
        let mut processed = 0;

        while let Some(record) = reader.next_record().await? {
            batch.push(record);
            if batch.len() < batch_size {
                continue;
            }

            processed += batch.len();
            let full_batch = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            results.extend(
                batch_processor
                    .process_batch(full_batch, parameters.clone())
                    .await?,
            );

            if processed >= self.config.segment_limit {
                // Reaching the limit exactly at the end of the blob is still a whole read
                if reader.peek().await?.is_none() {
                    return Ok(FirstPass::Whole(results));
                }
                return Ok(FirstPass::Split { results, reader });
            }
        }

        if !batch.is_empty() {
            results.extend(batch_processor.process_batch(batch, parameters).await?);
        }
        Ok(FirstPass::Whole(results))
    }

    /// Upload the first segment's output and fan the rest of the blob out to child tasks
    ///
    /// Returns the child partition key and the number of children.
    async fn split_into_children(
        &self,
        blob_name: &str,
        results: &[Value],
        mut reader: SegmentReader,
        parameters: Option<&str>,
    ) -> Result<(String, usize), ProcessingError> {
        self.upload_results(&self.first_segment_name(blob_name), results)
            .await?;

        let mut chunk_names = Vec::new();
        let mut chunk = String::new();
        let mut records_in_chunk = 0;
        loop {
            let record = reader.next_record().await?;
            if let Some(record) = &record {
                chunk.push_str(&encode_record(record));
                records_in_chunk += 1;
            }
            let full = records_in_chunk == self.config.segment_limit;
            let last = record.is_none() && records_in_chunk > 0;
            if full || last {
                let name = self.chunk_name(blob_name, chunk_names.len() + 1);
                self.blobs
                    .upload(INPUT_CONTAINER, &name, std::mem::take(&mut chunk).into_bytes())
                    .await?;
                debug!(chunk = %name, records = records_in_chunk, "uploaded child chunk");
                chunk_names.push(name);
                records_in_chunk = 0;
            }
            if record.is_none() {
                break;
            }
        }

        let partition = new_partition_key();
        let children: Vec<TaskId> = chunk_names
            .iter()
            .map(|name| TaskId::in_partition(partition.clone(), name))
            .collect();

        let mut entities = Vec::with_capacity(children.len());
        for (child, name) in children.iter().zip(&chunk_names) {
            let record = TaskRecord::for_blob(name.as_str(), parameters.map(str::to_string));
            entities.push(Entity::from_record(
                child.partition_key(),
                child.row_key(),
                &record,
            )?);
        }
        for group in entities.chunks(MAX_BATCH_OPERATIONS) {
            let operations = group.iter().cloned().map(BatchOperation::Insert).collect();
            self.store
                .batch_commit(&self.config.metadata_table, operations)
                .await?;
        }

        for child in &children {
            self.enqueue(child, Duration::ZERO).await?;
        }
        Ok((partition, children.len()))
    }

    /// Check the children of a parent; merge once all of them completed
    async fn poll_children(
        &self,
        task_id: &TaskId,
        row: &mut TaskRow,
        blob_name: &str,
        partition: &str,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let entities = self
            .store
            .query_partition(&self.config.metadata_table, partition)
            .await?;
        let total = entities.len();

        let mut completed_blobs = Vec::new();
        for entity in &entities {
            let child: TaskRecord = entity.to_record()?;
            if let Some(child_error) = &child.error {
                let err = ProcessingError::terminal(format!(
                    "child task {}_{} failed: {child_error}",
                    entity.partition_key, entity.row_key
                ));
                let err = match &child.stack_trace {
                    Some(trace) => err.with_trace(trace.clone()),
                    None => err,
                };
                return self.fail_terminally(task_id, row, &err).await;
            }
            if child.state == Some(TaskState::Completed) {
                if let Some(name) = child.blob_name {
                    completed_blobs.push(name);
                }
            }
        }

        let completed = completed_blobs.len();
        if completed == total {
            let output = self.output_name(blob_name);
            if let Err(err) = self.merge_outputs(blob_name, &output, completed_blobs).await {
                return self.handle_blob_failure(task_id, row, err).await;
            }
            if !self.complete(row, &output).await? {
                return Ok(ProcessOutcome::Superseded);
            }
            info!(children = total, %output, "merged child outputs");
            return Ok(ProcessOutcome::Completed);
        }

        let polls_done = row.record.poll_count + 1;
        if self.config.poll_policy.is_exhausted(polls_done) {
            let err = ProcessingError::terminal(format!(
                "gave up after {polls_done} polls with {completed} of {total} child tasks completed"
            ));
            return self.fail_terminally(task_id, row, &err).await;
        }

        row.record.progress = Some((completed * self.config.segment_limit) as u64);
        row.record.poll_count = polls_done;
        if !self.save(row).await? {
            return Ok(ProcessOutcome::Superseded);
        }
        let delay = self.config.poll_policy.delay_for_poll(polls_done);
        self.enqueue(task_id, delay).await?;

        debug!(completed, total, ?delay, "children still running");
        Ok(ProcessOutcome::Polling { completed, total })
    }

    /// Concatenate the first segment and the child outputs in numeric suffix order
    async fn merge_outputs(
        &self,
        blob_name: &str,
        output: &str,
        child_blobs: Vec<String>,
    ) -> Result<(), ProcessingError> {
        let mut parts = vec![(0, self.first_segment_name(blob_name))];
        for child_blob in child_blobs {
            let suffix = numeric_suffix(&child_blob).ok_or_else(|| {
                ProcessingError::terminal(format!("child blob {child_blob} has no numeric suffix"))
            })?;
            parts.push((suffix, self.output_name(&child_blob)));
        }
        parts.sort_by_key(|(suffix, _)| *suffix);

        let mut contents = Vec::with_capacity(parts.len());
        for (_, name) in &parts {
            let bytes = self.blobs.download(OUTPUT_CONTAINER, name).await?;
            let content = String::from_utf8(bytes).map_err(|e| {
                ProcessingError::transient(format!("output {name} is not valid UTF-8: {e}"))
            })?;
            if !content.is_empty() {
                contents.push(content);
            }
        }

        self.blobs
            .upload(OUTPUT_CONTAINER, output, contents.join("\n").into_bytes())
            .await?;
        Ok(())
    }

    /// Retry a transient blob failure or record it as terminal
    async fn handle_blob_failure(
        &self,
        task_id: &TaskId,
        row: &mut TaskRow,
        err: ProcessingError,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let policy = &self.config.retry_policy;

        if err.is_transient() && policy.allows_retry(row.record.retry_count) {
            let retry_count = row.record.retry_count + 1;
            let delay = policy.delay_before_retry(retry_count);
            row.record.retry_count = retry_count;
            if !self.save(row).await? {
                return Ok(ProcessOutcome::Superseded);
            }
            self.enqueue(task_id, delay).await?;

            warn!(error = %err, retry_count, ?delay, "blob processing failed, retrying");
            return Ok(ProcessOutcome::RetryScheduled {
                retry_count,
                delay,
            });
        }

        self.fail_terminally(task_id, row, &err).await
    }

    /// Record a terminal failure on the row and in the failure log
    async fn fail_terminally(
        &self,
        task_id: &TaskId,
        row: &mut TaskRow,
        err: &ProcessingError,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        error!(error = %err, retry_count = row.record.retry_count, "task failed");
        if !self.write_failure(row, err).await? {
            return Ok(ProcessOutcome::Superseded);
        }
        if self.config.record_failures {
            self.append_failure_log(task_id, err).await?;
        }
        Ok(ProcessOutcome::Failed)
    }

    async fn write_failure(
        &self,
        row: &mut TaskRow,
        err: &ProcessingError,
    ) -> Result<bool, OrchestratorError> {
        row.record.result = None;
        row.record.error = Some(err.message().to_string());
        row.record.stack_trace = Some(stack_trace(err));
        self.save(row).await
    }

    async fn append_failure_log(
        &self,
        task_id: &TaskId,
        err: &ProcessingError,
    ) -> Result<(), OrchestratorError> {
        let record = FailureRecord {
            failure_message: err.message().to_string(),
            stack_trace: stack_trace(err),
        };
        let entity = Entity::from_record(
            self.config.worker_name.as_str(),
            task_id.to_string(),
            &record,
        )?;
        let table = &self.config.failure_table;

        match self.store.insert(table, entity.clone()).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists { .. }) => {
                self.store.update(table, entity).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a blob task completed, pointing its result at the output blob
    async fn complete(&self, row: &mut TaskRow, output: &str) -> Result<bool, OrchestratorError> {
        row.record.state = Some(TaskState::Completed);
        if row.record.result.is_none() {
            let descriptor = json!({ "container": OUTPUT_CONTAINER, "blob": output });
            row.record.result = Some(descriptor.to_string());
        }
        self.save(row).await
    }

    async fn upload_results(&self, name: &str, results: &[Value]) -> Result<(), ProcessingError> {
        let lines: Vec<String> = results.iter().map(Value::to_string).collect();
        self.blobs
            .upload(OUTPUT_CONTAINER, name, lines.join("\n").into_bytes())
            .await?;
        Ok(())
    }

    async fn load(&self, task_id: &TaskId) -> Result<TaskRow, OrchestratorError> {
        let entity = match self
            .store
            .get(
                &self.config.metadata_table,
                task_id.partition_key(),
                task_id.row_key(),
            )
            .await
        {
            Ok(entity) => entity,
            Err(e) if e.is_not_found() => {
                return Err(OrchestratorError::TaskNotFound(task_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let record = entity.to_record()?;
        Ok(TaskRow { entity, record })
    }

    /// Write the row back; `false` when another writer got there first
    async fn save(&self, row: &mut TaskRow) -> Result<bool, OrchestratorError> {
        row.entity.replace_record(&row.record)?;
        let table = &self.config.metadata_table;
        let written = if self.config.optimistic_concurrency {
            self.store.update_if_match(table, row.entity.clone()).await
        } else {
            self.store.update(table, row.entity.clone()).await
        };

        match written {
            Ok(stored) => {
                row.entity = stored;
                Ok(true)
            }
            Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                warn!(expected, actual, "task row changed concurrently, abandoning this pass");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue(&self, task_id: &TaskId, delay: Duration) -> Result<(), StoreError> {
        let body = encode_message(&task_id.to_string());
        if delay.is_zero() {
            self.queue.enqueue(&body).await
        } else {
            self.queue.enqueue_after(&body, delay).await
        }
    }

    /// Final output blob of `blob_name`
    fn output_name(&self, blob_name: &str) -> String {
        format!("{}/{}", self.config.worker_name, blob_name)
    }

    /// Output blob of the first segment of a split blob
    fn first_segment_name(&self, blob_name: &str) -> String {
        format!("{}/{}_0", self.config.worker_name, blob_name)
    }

    /// Input blob of the `index`-th child chunk (1-based)
    fn chunk_name(&self, blob_name: &str, index: usize) -> String {
        format!("{}/{}_{}", self.config.worker_name, blob_name, index)
    }
}

fn stack_trace(err: &ProcessingError) -> String {
    err.trace()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{err:?}"))
}

fn numeric_suffix(name: &str) -> Option<u64> {
    name.rsplit_once('_')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{decode_message, InMemoryBlobStore, InMemoryEntityStore, InMemoryQueue};
    use crate::reliability::{PollPolicy, RetryPolicy};

    struct Fixture {
        store: Arc<InMemoryEntityStore>,
        queue: Arc<InMemoryQueue>,
        blobs: Arc<InMemoryBlobStore>,
        orchestrator: TaskOrchestrator,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let store = Arc::new(InMemoryEntityStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let blobs = Arc::new(InMemoryBlobStore::with_chunk_size(16));
        let orchestrator = TaskOrchestrator::new(
            store.clone(),
            queue.clone(),
            blobs.clone(),
            config
                .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 4))
                .with_poll_policy(PollPolicy::immediate()),
        )
        .unwrap();
        Fixture {
            store,
            queue,
            blobs,
            orchestrator,
        }
    }

    fn echo_request() -> impl RequestProcessor {
        |payload: Value| async move { Ok::<_, ProcessingError>(json!({ "echo": payload })) }
    }

    fn echo_batch() -> impl BatchProcessor {
        |batch: Vec<String>, _params: Option<Value>| async move {
            Ok::<Vec<Value>, ProcessingError>(batch.into_iter().map(Value::String).collect())
        }
    }

    fn lines(records: impl IntoIterator<Item = String>) -> String {
        records.into_iter().map(|r| encode_record(&r)).collect()
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = TaskOrchestrator::new(
            Arc::new(InMemoryEntityStore::new()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryBlobStore::new()),
            OrchestratorConfig::new("w").with_batch_size(7),
        );
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn test_trigger_inserts_row_and_enqueues_id() {
        let f = fixture(OrchestratorConfig::new("w"));
        let task_id = f.orchestrator.trigger(&json!({"x": 1})).await.unwrap();

        assert_eq!(f.store.entity_count("taskMetadata"), 1);
        let bodies = f.queue.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(decode_message(&bodies[0]).unwrap(), task_id.to_string());
    }

    #[tokio::test]
    async fn test_trigger_sends_wake_up_signal() {
        let f = fixture(OrchestratorConfig::new("w"));
        let wake_up = Arc::new(InMemoryQueue::new());
        let orchestrator = f.orchestrator.with_wake_up_queue(wake_up.clone());

        orchestrator.trigger_blob("in.jsonl", None).await.unwrap();

        assert_eq!(wake_up.bodies(), vec!["d2FrZSB1cA==".to_string()]);
    }

    #[tokio::test]
    async fn test_process_missing_task() {
        let f = fixture(OrchestratorConfig::new("w"));
        let task_id = TaskId::new("nope", "nothing").unwrap();

        let result = f
            .orchestrator
            .process_message(&task_id, &echo_request(), None)
            .await;
        assert!(matches!(result, Err(OrchestratorError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_redelivered_request_is_not_reprocessed() {
        let f = fixture(OrchestratorConfig::new("w"));
        let task_id = f.orchestrator.trigger(&json!(1)).await.unwrap();

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let processor = move |payload: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, ProcessingError>(payload)
            }
        };

        let first = f
            .orchestrator
            .process_message(&task_id, &processor, None)
            .await
            .unwrap();
        let second = f
            .orchestrator
            .process_message(&task_id, &processor, None)
            .await
            .unwrap();

        assert_eq!(first, ProcessOutcome::Completed);
        assert_eq!(second, ProcessOutcome::AlreadyCompleted);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_failure_without_failure_log_is_returned() {
        let f = fixture(OrchestratorConfig::new("w"));
        let task_id = f.orchestrator.trigger(&json!({})).await.unwrap();
        let failing = |_: Value| async move {
            Err::<Value, _>(ProcessingError::transient("upstream unavailable"))
        };

        let result = f
            .orchestrator
            .process_message(&task_id, &failing, None)
            .await;
        assert!(matches!(result, Err(OrchestratorError::Processing { .. })));

        let task = f.orchestrator.get_result(&task_id).await.unwrap();
        assert_eq!(task.error.as_deref(), Some("upstream unavailable"));
        assert!(task.stack_trace.is_some());
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_request_failure_with_failure_log_is_recorded() {
        let f = fixture(OrchestratorConfig::new("w").with_record_failures(true));
        let task_id = f.orchestrator.trigger(&json!({})).await.unwrap();
        let failing =
            |_: Value| async move { Err::<Value, _>(ProcessingError::terminal("bad payload")) };

        let outcome = f
            .orchestrator
            .process_message(&task_id, &failing, None)
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);

        let logged = f
            .store
            .get("executionFailures", "w", &task_id.to_string())
            .await
            .unwrap();
        let record: FailureRecord = logged.to_record().unwrap();
        assert_eq!(record.failure_message, "bad payload");
    }

    #[tokio::test]
    async fn test_blob_without_batch_processor_fails() {
        let f = fixture(OrchestratorConfig::new("w").with_record_failures(true));
        f.blobs.put(INPUT_CONTAINER, "b", lines(["a".to_string()]));
        let task_id = f.orchestrator.trigger_blob("b", None).await.unwrap();

        let outcome = f
            .orchestrator
            .process_message(&task_id, &echo_request(), None)
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);
    }

    #[tokio::test]
    async fn test_parameters_reach_batch_processor() {
        let f = fixture(OrchestratorConfig::new("w").with_segment_limit(2).with_batch_size(2));
        f.blobs.put(INPUT_CONTAINER, "b", lines(["a".to_string()]));
        let task_id = f
            .orchestrator
            .trigger_blob("b", Some(&json!({"suffix": "!"})))
            .await
            .unwrap();

        let processor = |batch: Vec<String>, params: Option<Value>| async move {
            let suffix = params
                .as_ref()
                .and_then(|p| p["suffix"].as_str())
                .unwrap_or_default()
                .to_string();
            Ok::<Vec<Value>, ProcessingError>(
                batch.into_iter().map(|r| json!(format!("{r}{suffix}"))).collect(),
            )
        };
        f.orchestrator
            .process_message(&task_id, &echo_request(), Some(&processor))
            .await
            .unwrap();

        assert_eq!(f.blobs.get(OUTPUT_CONTAINER, "w/b").unwrap(), b"\"a!\"".to_vec());
    }

    #[tokio::test]
    async fn test_row_with_request_and_blob_runs_both() {
        let f = fixture(OrchestratorConfig::new("w").with_segment_limit(2).with_batch_size(1));
        f.blobs.put(INPUT_CONTAINER, "b", lines(["r1".to_string()]));

        let record = TaskRecord {
            request_body: Some("{\"x\":1}".to_string()),
            ..TaskRecord::for_blob("b", None)
        };
        let task_id = TaskId::generate("b");
        let entity = Entity::from_record(task_id.partition_key(), task_id.row_key(), &record).unwrap();
        f.store.insert("taskMetadata", entity).await.unwrap();

        let outcome = f
            .orchestrator
            .process_message(&task_id, &echo_request(), Some(&echo_batch()))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let result = f.orchestrator.get_result(&task_id).await.unwrap();
        assert_eq!(result.result, Some(json!({"echo": {"x": 1}})));
        assert!(f.blobs.get(OUTPUT_CONTAINER, "w/b").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_writer_supersedes_pass() {
        struct RacingProcessor {
            store: Arc<InMemoryEntityStore>,
            task_id: TaskId,
        }

        #[async_trait::async_trait]
        impl RequestProcessor for RacingProcessor {
            async fn process(&self, payload: Value) -> Result<Value, ProcessingError> {
                // Another worker writes the row while this one is processing
                let entity = self
                    .store
                    .get("taskMetadata", self.task_id.partition_key(), self.task_id.row_key())
                    .await
                    .unwrap();
                self.store.update("taskMetadata", entity).await.unwrap();
                Ok(payload)
            }
        }

        let f = fixture(OrchestratorConfig::new("w"));
        let task_id = f.orchestrator.trigger(&json!(5)).await.unwrap();
        let processor = RacingProcessor {
            store: f.store.clone(),
            task_id: task_id.clone(),
        };

        let outcome = f
            .orchestrator
            .process_message(&task_id, &processor, None)
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Superseded);
        assert!(!f.orchestrator.get_result(&task_id).await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_poll_limit_fails_parent() {
        let f = fixture(OrchestratorConfig::new("w").with_segment_limit(1).with_batch_size(1));
        f.blobs.put(
            INPUT_CONTAINER,
            "b",
            lines(["a".to_string(), "b".to_string()]),
        );
        let orchestrator = TaskOrchestrator::new(
            f.store.clone(),
            f.queue.clone(),
            f.blobs.clone(),
            f.orchestrator
                .config()
                .clone()
                .with_poll_policy(PollPolicy::immediate().with_max_polls(Some(2))),
        )
        .unwrap();
        let task_id = orchestrator.trigger_blob("b", None).await.unwrap();
        let batch = echo_batch();

        let split = orchestrator
            .process_message(&task_id, &echo_request(), Some(&batch))
            .await
            .unwrap();
        assert_eq!(split, ProcessOutcome::Split { children: 1 });

        let first_poll = orchestrator
            .process_message(&task_id, &echo_request(), Some(&batch))
            .await
            .unwrap();
        assert_eq!(first_poll, ProcessOutcome::Polling { completed: 0, total: 1 });

        let second_poll = orchestrator
            .process_message(&task_id, &echo_request(), Some(&batch))
            .await
            .unwrap();
        assert_eq!(second_poll, ProcessOutcome::Failed);

        let result = orchestrator.get_result(&task_id).await.unwrap();
        assert!(result.error.unwrap().contains("gave up after 2 polls"));
    }

    #[test]
    fn test_numeric_suffix() {
        assert_eq!(numeric_suffix("w/big.jsonl_12"), Some(12));
        assert_eq!(numeric_suffix("w/my_file.jsonl_3"), Some(3));
        assert_eq!(numeric_suffix("no-suffix"), None);
        assert_eq!(numeric_suffix("w/x_abc"), None);
    }
}
