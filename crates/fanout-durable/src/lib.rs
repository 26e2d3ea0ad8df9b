//! # Fanout Durable
//!
//! A queue-driven task orchestrator for reliable processing of small payloads
//! and large line-delimited blobs.
//!
//! ## Features
//!
//! - **Durable task state**: every task is a row in a partition/row keyed table store,
//!   so any worker can pick a task up after a crash
//! - **Blob fan-out**: blobs larger than the segment limit are split into child tasks
//!   that run independently and are merged in order once all of them complete
//! - **Automatic retries**: transient blob failures are retried with exponential backoff
//!   up to a fixed ceiling
//! - **Fleet cap**: a shared state row limits how many workers drain a queue at once
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QueueWorker                             │
//! │  (receives task ids, gated by WorkerStateGate)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TaskOrchestrator                          │
//! │  (whole payloads, blob segments, child fan-out, poll/merge) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          EntityStore · DurableQueue · BlobStore              │
//! │  (external services; in-memory implementations included)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use fanout_durable::prelude::*;
//!
//! let orchestrator = TaskOrchestrator::new(store, queue, blobs, OrchestratorConfig::default())?;
//! let task_id = orchestrator.trigger_blob("input.jsonl", None).await?;
//!
//! let batch = |records: Vec<String>, _params: Option<Value>| async move {
//!     Ok(records.into_iter().map(Value::String).collect())
//! };
//! orchestrator.process_message(&task_id, &reject_payloads, Some(&batch)).await?;
//!
//! println!("{}", orchestrator.get_result(&task_id).await?.to_json());
//! ```

pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        BatchProcessor, OrchestratorConfig, OrchestratorError, ProcessOutcome, ProcessingError,
        RequestProcessor, TaskId, TaskOrchestrator, TaskResult,
    };
    pub use crate::persistence::{
        BlobStore, DurableQueue, EntityStore, InMemoryBlobStore, InMemoryEntityStore,
        InMemoryQueue, StoreError, INPUT_CONTAINER, OUTPUT_CONTAINER,
    };
    pub use crate::reliability::{PollPolicy, RetryPolicy};
    pub use crate::worker::{
        DrainReport, GateConfig, QueueWorker, QueueWorkerConfig, WorkerError, WorkerStateGate,
    };
}

// Re-export key types at crate root
pub use engine::{
    BatchProcessor, OrchestratorConfig, OrchestratorError, ProcessOutcome, ProcessingError,
    RequestProcessor, TaskId, TaskOrchestrator, TaskResult,
};
pub use persistence::{
    BlobStore, DurableQueue, EntityStore, InMemoryBlobStore, InMemoryEntityStore, InMemoryQueue,
    StoreError,
};
pub use reliability::{PollPolicy, RetryPolicy};
pub use worker::{QueueWorker, QueueWorkerConfig, WorkerStateGate};
