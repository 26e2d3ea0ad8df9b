//! Queue workers
//!
//! This module provides:
//! - [`QueueWorker`] - Drains the task queue through a [`TaskOrchestrator`](crate::engine::TaskOrchestrator)
//! - [`WorkerStateGate`] - Best-effort fleet-wide cap on concurrently draining workers
//! - [`IdlePolicy`] - Wait between drains of a running worker
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueWorker                            │
//! │  ┌─────────────────┐        ┌──────────────────────────┐    │
//! │  │ WorkerStateGate │        │ IdleBackoff (run loop)   │    │
//! │  │ (enter / exit)  │        │                          │    │
//! │  └────────┬────────┘        └──────────────────────────┘    │
//! │           │                                                  │
//! │           ▼                                                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  receive(32) → decode id → process_message → delete │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod gate;
mod poller;
mod runner;

pub use gate::{GateConfig, WorkerStateGate, DEFAULT_STATE_TABLE};
pub use poller::{IdleBackoff, IdlePolicy};
pub use runner::{DrainReport, QueueWorker, QueueWorkerConfig, WorkerError};
