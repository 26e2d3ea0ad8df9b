//! Wait between queue drains
//!
//! A drain that found work resets the wait to `min_wait`; an idle or failed
//! drain stretches it by `growth` up to `max_wait`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::reliability::duration_millis;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdlePolicy {
    #[serde(with = "duration_millis")]
    pub min_wait: Duration,

    #[serde(with = "duration_millis")]
    pub max_wait: Duration,

    /// Factor applied after each idle drain, at least 1.0
    pub growth: f64,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(5),
            growth: 1.5,
        }
    }
}

impl IdlePolicy {
    pub fn with_min_wait(mut self, wait: Duration) -> Self {
        self.min_wait = wait;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    pub fn with_growth(mut self, growth: f64) -> Self {
        self.growth = growth.max(1.0);
        self
    }
}

/// Tracks the current wait of a running worker
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    policy: IdlePolicy,
    wait: Duration,
}

impl IdleBackoff {
    pub fn new(policy: IdlePolicy) -> Self {
        Self {
            wait: policy.min_wait,
            policy,
        }
    }

    pub fn current_wait(&self) -> Duration {
        self.wait
    }

    /// Update the wait from the outcome of a drain and return it
    pub fn record_drain(&mut self, found_work: bool) -> Duration {
        self.wait = if found_work {
            self.policy.min_wait
        } else {
            Duration::from_secs_f64(self.wait.as_secs_f64() * self.policy.growth)
                .min(self.policy.max_wait)
        };
        self.wait
    }

    /// Sleep for the current wait; returns true if shutdown was signalled first
    pub async fn wait(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.wait) => *shutdown.borrow(),
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}
