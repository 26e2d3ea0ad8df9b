//! Reliability patterns for task processing
//!
//! This module provides:
//! - [`RetryPolicy`] - Retry ceiling with exponential backoff for transient failures
//! - [`PollPolicy`] - Backoff and poll limit for parents waiting on children

mod poll;
mod retry;

pub use poll::PollPolicy;
pub use retry::RetryPolicy;

/// Serde support for `Duration` as whole milliseconds
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
