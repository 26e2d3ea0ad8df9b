//! Orchestrator configuration

use serde::{Deserialize, Serialize};

use crate::reliability::{PollPolicy, RetryPolicy};

/// Default table holding task metadata rows
pub const DEFAULT_METADATA_TABLE: &str = "taskMetadata";

/// Table receiving failure log rows
pub const DEFAULT_FAILURE_TABLE: &str = "executionFailures";

/// Invalid orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("segment limit {segment_limit} is not a multiple of batch size {batch_size}")]
    UnevenBatches {
        segment_limit: usize,
        batch_size: usize,
    },

    #[error("worker name must be non-empty")]
    EmptyWorkerName,
}

/// Configuration for [`TaskOrchestrator`](super::TaskOrchestrator)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Prefix of every output blob and partition key of failure log rows
    pub worker_name: String,

    pub metadata_table: String,

    pub failure_table: String,

    /// Records handled by a single task before the rest is split off
    pub segment_limit: usize,

    /// Records per batch processor call
    pub batch_size: usize,

    /// Append terminal failures to the failure log table
    pub record_failures: bool,

    /// Write task rows with compare-and-swap on their version
    pub optimistic_concurrency: bool,

    /// Retries of blob tasks after transient failures
    pub retry_policy: RetryPolicy,

    /// Re-checks of parents waiting on children
    pub poll_policy: PollPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker".to_string(),
            metadata_table: DEFAULT_METADATA_TABLE.to_string(),
            failure_table: DEFAULT_FAILURE_TABLE.to_string(),
            segment_limit: 1000,
            batch_size: 100,
            record_failures: false,
            optimistic_concurrency: true,
            retry_policy: RetryPolicy::default(),
            poll_policy: PollPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from `FANOUT_*` environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_name =
            std::env::var("FANOUT_WORKER_NAME").unwrap_or_else(|_| defaults.worker_name.clone());
        let metadata_table = std::env::var("FANOUT_METADATA_TABLE")
            .unwrap_or_else(|_| defaults.metadata_table.clone());
        let segment_limit = std::env::var("FANOUT_SEGMENT_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.segment_limit);
        let batch_size = std::env::var("FANOUT_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_size);
        let record_failures = std::env::var("FANOUT_FAILURE_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.record_failures);
        let retry_policy = match std::env::var("FANOUT_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            Some(retries) => defaults.retry_policy.clone().with_retries(retries),
            None => defaults.retry_policy.clone(),
        };

        Self {
            worker_name,
            metadata_table,
            segment_limit,
            batch_size,
            record_failures,
            retry_policy,
            ..defaults
        }
    }

    pub fn with_worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = worker_name.into();
        self
    }

    pub fn with_metadata_table(mut self, table: impl Into<String>) -> Self {
        self.metadata_table = table.into();
        self
    }

    pub fn with_failure_table(mut self, table: impl Into<String>) -> Self {
        self.failure_table = table.into();
        self
    }

    pub fn with_segment_limit(mut self, segment_limit: usize) -> Self {
        self.segment_limit = segment_limit;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_record_failures(mut self, enabled: bool) -> Self {
        self.record_failures = enabled;
        self
    }

    pub fn with_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.optimistic_concurrency = enabled;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    /// Check the segment arithmetic and naming constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_name.is_empty() {
            return Err(ConfigError::EmptyWorkerName);
        }
        if self.segment_limit == 0 {
            return Err(ConfigError::Zero("segment limit"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch size"));
        }
        if self.segment_limit % self.batch_size != 0 {
            return Err(ConfigError::UnevenBatches {
                segment_limit: self.segment_limit,
                batch_size: self.batch_size,
            });
        }
        Ok(())
    }
}
