//! Poll schedule for parent tasks waiting on their children

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::duration_millis;

/// How a parent task re-checks its child tasks
///
/// Each pass that finds unfinished children re-enqueues the parent with a
/// growing delay. After `max_polls` such passes the parent fails, so one
/// stuck child cannot keep it polling forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollPolicy {
    /// Delay before the first poll
    #[serde(with = "duration_millis")]
    pub first_delay: Duration,

    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    pub multiplier: f64,

    /// Unfinished polls tolerated before the parent fails; `None` polls forever
    pub max_polls: Option<u32>,
}

impl Default for PollPolicy {
    /// 1s doubling up to 60s, giving up after roughly a day
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_polls: Some(1440),
        }
    }
}

impl PollPolicy {
    /// Poll again without delay and without a limit
    pub fn immediate() -> Self {
        Self {
            first_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_polls: None,
        }
    }

    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_polls(mut self, max_polls: Option<u32>) -> Self {
        self.max_polls = max_polls;
        self
    }

    /// Delay before the poll that follows `polls_done` unfinished polls
    pub fn delay_for_poll(&self, polls_done: u32) -> Duration {
        let grown = self.first_delay.as_secs_f64() * self.multiplier.powi(polls_done.min(64) as i32);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    pub fn is_exhausted(&self, polls_done: u32) -> bool {
        matches!(self.max_polls, Some(max) if polls_done >= max)
    }
}
