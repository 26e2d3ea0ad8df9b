//! Queue worker loop
//!
//! Receives task ids from the queue and hands them to the orchestrator,
//! deleting each message once it has been handled.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::gate::WorkerStateGate;
use super::poller::{IdleBackoff, IdlePolicy};
use crate::engine::{
    BatchProcessor, OrchestratorError, ProcessOutcome, RequestProcessor, TaskId, TaskOrchestrator,
};
use crate::persistence::{decode_message, DurableQueue, QueueMessage, StoreError};

/// Queue worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueWorkerConfig {
    /// Messages requested per receive call
    pub receive_batch: usize,

    /// Wait between drains in [`QueueWorker::run`]
    pub idle: IdlePolicy,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            receive_batch: 32,
            idle: IdlePolicy::default(),
        }
    }
}

impl QueueWorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let receive_batch = std::env::var("FANOUT_RECEIVE_BATCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(32);

        Self {
            receive_batch,
            ..Default::default()
        }
    }

    pub fn with_receive_batch(mut self, receive_batch: usize) -> Self {
        self.receive_batch = receive_batch.max(1);
        self
    }

    pub fn with_idle_policy(mut self, idle: IdlePolicy) -> Self {
        self.idle = idle;
        self
    }
}

/// Errors that stop a drain
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Summary of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// The worker gate was full; nothing was received
    pub declined: bool,

    /// Messages handed to the orchestrator and deleted
    pub processed: usize,

    /// Of those, messages whose task reached a terminal state
    pub finished: usize,

    /// Undecodable messages or messages for unknown tasks, deleted unprocessed
    pub dead_lettered: usize,
}

impl DrainReport {
    pub fn declined() -> Self {
        Self {
            declined: true,
            ..Default::default()
        }
    }

    /// Whether the drain handled any message
    pub fn found_work(&self) -> bool {
        self.processed + self.dead_lettered > 0
    }
}

/// Drains a task queue through a [`TaskOrchestrator`]
///
/// # Example
///
/// ```ignore
/// let worker = QueueWorker::new(orchestrator, queue, QueueWorkerConfig::default())
///     .with_gate(WorkerStateGate::new(store, GateConfig::for_queue("tasks")));
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// worker.run(&processor, Some(&batch_processor), shutdown_rx).await;
/// ```
pub struct QueueWorker {
    orchestrator: Arc<TaskOrchestrator>,
    queue: Arc<dyn DurableQueue>,
    gate: Option<WorkerStateGate>,
    config: QueueWorkerConfig,
}

impl QueueWorker {
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        queue: Arc<dyn DurableQueue>,
        config: QueueWorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            gate: None,
            config,
        }
    }

    /// Admit drains through a fleet-wide worker gate
    pub fn with_gate(mut self, gate: WorkerStateGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Process messages until the queue has no visible messages left
    ///
    /// The gate slot is released however the drain ends, including panics
    /// raised by the processors.
    #[instrument(skip_all)]
    pub async fn drain(
        &self,
        processor: &dyn RequestProcessor,
        batch_processor: Option<&dyn BatchProcessor>,
    ) -> Result<DrainReport, WorkerError> {
        if let Some(gate) = &self.gate {
            if !gate.try_enter().await? {
                return Ok(DrainReport::declined());
            }
        }

        let drained = AssertUnwindSafe(self.drain_queue(processor, batch_processor))
            .catch_unwind()
            .await;

        if let Some(gate) = &self.gate {
            if let Err(e) = gate.exit().await {
                error!(error = %e, "failed to release worker gate");
            }
        }

        match drained {
            Ok(report) => report,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Drain repeatedly until `shutdown` becomes true
    pub async fn run(
        &self,
        processor: &dyn RequestProcessor,
        batch_processor: Option<&dyn BatchProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = IdleBackoff::new(self.config.idle.clone());
        info!("queue worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let found_work = match self.drain(processor, batch_processor).await {
                Ok(report) => {
                    if report.found_work() {
                        info!(
                            processed = report.processed,
                            finished = report.finished,
                            dead_lettered = report.dead_lettered,
                            "drained queue"
                        );
                    }
                    report.found_work()
                }
                Err(e) => {
                    error!(error = %e, "drain failed");
                    false
                }
            };
            backoff.record_drain(found_work);

            if backoff.wait(&mut shutdown).await {
                break;
            }
        }

        info!("queue worker stopped");
    }

    async fn drain_queue(
        &self,
        processor: &dyn RequestProcessor,
        batch_processor: Option<&dyn BatchProcessor>,
    ) -> Result<DrainReport, WorkerError> {
        let mut report = DrainReport::default();

        loop {
            let messages = self.queue.receive(self.config.receive_batch).await?;
            debug!(count = messages.len(), "received messages");
            if messages.is_empty() {
                break;
            }

            for message in messages {
                match self.handle(&message, processor, batch_processor).await? {
                    Some(outcome) => {
                        report.processed += 1;
                        if outcome.is_terminal() {
                            report.finished += 1;
                        }
                    }
                    None => report.dead_lettered += 1,
                }
                self.delete(&message).await?;
            }
        }

        Ok(report)
    }

    /// Process one message; `None` when it cannot be processed at all
    async fn handle(
        &self,
        message: &QueueMessage,
        processor: &dyn RequestProcessor,
        batch_processor: Option<&dyn BatchProcessor>,
    ) -> Result<Option<ProcessOutcome>, WorkerError> {
        let task_id = match decode_message(&message.body)
            .map_err(|e| e.to_string())
            .and_then(|body| body.parse::<TaskId>().map_err(|e| e.to_string()))
        {
            Ok(task_id) => task_id,
            Err(reason) => {
                warn!(message_id = %message.id, %reason, "dropping undecodable message");
                return Ok(None);
            }
        };

        match self
            .orchestrator
            .process_message(&task_id, processor, batch_processor)
            .await
        {
            Ok(outcome) => {
                debug!(%task_id, ?outcome, "processed message");
                Ok(Some(outcome))
            }
            Err(OrchestratorError::TaskNotFound(_)) => {
                warn!(%task_id, "dropping message for unknown task");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), WorkerError> {
        match self.queue.delete(message).await {
            Ok(()) => Ok(()),
            Err(StoreError::MessageNotFound(id)) => {
                warn!(message_id = %id, "message already gone, visibility may have expired");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
