//! Task orchestration engine
//!
//! The engine module provides the `TaskOrchestrator`, which drives a task
//! through whole-payload processing or blob segmentation, fan-out to child
//! tasks, polling and merge, together with the row types and task ids it
//! persists.

mod config;
mod orchestrator;
mod processor;
mod record;
mod result;
mod segments;
mod task_id;

pub use config::{ConfigError, OrchestratorConfig, DEFAULT_FAILURE_TABLE, DEFAULT_METADATA_TABLE};
pub use orchestrator::{OrchestratorError, ProcessOutcome, TaskOrchestrator, WAKE_UP_MESSAGE};
pub use processor::{BatchProcessor, ProcessingError, RequestProcessor};
pub use record::{FailureRecord, TaskRecord, TaskState, WorkerStateRecord};
pub use result::TaskResult;
pub use segments::{encode_record, SegmentError, SegmentReader};
pub use task_id::{content_hash, new_partition_key, TaskId, TaskIdError, TASK_ID_SEPARATOR};
