//! Fleet-wide cap on concurrently draining workers
//!
//! All workers of one queue share a single state row holding the number of
//! active workers, the cap and the time of the last change. Reads and writes
//! are plain last-writer-wins updates: concurrent workers may over- or
//! undercount. The gate only thins out redundant polling fleets; it is not a
//! lock and nothing relies on it for correctness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::WorkerStateRecord;
use crate::persistence::{Entity, EntityStore, StoreError};
use crate::reliability::duration_millis;

/// Default table holding the worker state row
pub const DEFAULT_STATE_TABLE: &str = "workerState";

/// Worker state gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    pub table: String,

    /// Partition key of the state row, usually the queue name
    pub partition_key: String,

    pub row_key: String,

    /// How long a full gate may go without updates before it is overridden
    #[serde(with = "duration_millis")]
    pub stale_after: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_STATE_TABLE.to_string(),
            partition_key: "worker".to_string(),
            row_key: "state".to_string(),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl GateConfig {
    /// Gate for the workers draining `queue_name`
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            partition_key: queue_name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let stale_after = std::env::var("FANOUT_STALE_AFTER_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_after);

        Self {
            stale_after,
            ..defaults
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

/// Best-effort admission gate over the shared worker state row
pub struct WorkerStateGate {
    store: Arc<dyn EntityStore>,
    config: GateConfig,
}

impl WorkerStateGate {
    pub fn new(store: Arc<dyn EntityStore>, config: GateConfig) -> Self {
        Self { store, config }
    }

    /// Create the state row with `max_count` slots unless it already exists
    pub async fn ensure_row(&self, max_count: u32) -> Result<(), StoreError> {
        let record = WorkerStateRecord {
            active_count: 0,
            max_count,
            update_date: Utc::now(),
        };
        let entity = Entity::from_record(
            self.config.partition_key.as_str(),
            self.config.row_key.as_str(),
            &record,
        )?;

        match self.store.insert(&self.config.table, entity).await {
            Ok(_) => {
                info!(max_count, "created worker state row");
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current contents of the state row
    pub async fn state(&self) -> Result<WorkerStateRecord, StoreError> {
        self.load().await?.to_record()
    }

    /// Take a worker slot
    ///
    /// Declines when all slots are taken, unless the row has not changed for
    /// longer than `stale_after`, in which case the previous holders are
    /// assumed stuck and the caller proceeds anyway.
    pub async fn try_enter(&self) -> Result<bool, StoreError> {
        let mut entity = self.load().await?;
        let mut state: WorkerStateRecord = entity.to_record()?;
        let now = Utc::now();

        if state.active_count >= state.max_count {
            let idle = now
                .signed_duration_since(state.update_date)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle <= self.config.stale_after {
                info!(
                    active = state.active_count,
                    max = state.max_count,
                    "there are already enough active workers"
                );
                return Ok(false);
            }
            warn!(
                active = state.active_count,
                idle_secs = idle.as_secs(),
                "workers have been active for too long, processing anyway"
            );
        }

        state.active_count = state.active_count.saturating_add(1);
        state.update_date = now;
        entity.replace_record(&state)?;
        self.store.update(&self.config.table, entity).await?;

        debug!(active = state.active_count, "entered worker gate");
        Ok(true)
    }

    /// Release all slots
    pub async fn exit(&self) -> Result<(), StoreError> {
        let mut entity = self.load().await?;
        let mut state: WorkerStateRecord = entity.to_record()?;

        state.active_count = 0;
        state.update_date = Utc::now();
        entity.replace_record(&state)?;
        self.store.update(&self.config.table, entity).await?;

        debug!("left worker gate");
        Ok(())
    }

    /// The configured row, or else whichever row the state table holds
    async fn load(&self) -> Result<Entity, StoreError> {
        let table = &self.config.table;
        match self
            .store
            .get(table, &self.config.partition_key, &self.config.row_key)
            .await
        {
            Err(e) if e.is_not_found() => {
                let mut rows = self.store.query_table(table).await?;
                if rows.is_empty() {
                    return Err(e);
                }
                Ok(rows.swap_remove(0))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryEntityStore;

    fn gate() -> (Arc<InMemoryEntityStore>, WorkerStateGate) {
        let store = Arc::new(InMemoryEntityStore::new());
        let gate = WorkerStateGate::new(store.clone(), GateConfig::for_queue("tasks"));
        (store, gate)
    }

    #[tokio::test]
    async fn test_enter_until_full() {
        let (_, gate) = gate();
        gate.ensure_row(2).await.unwrap();

        assert!(gate.try_enter().await.unwrap());
        assert!(gate.try_enter().await.unwrap());
        assert!(!gate.try_enter().await.unwrap());
        assert_eq!(gate.state().await.unwrap().active_count, 2);
    }

    #[tokio::test]
    async fn test_exit_resets_count() {
        let (_, gate) = gate();
        gate.ensure_row(1).await.unwrap();
        assert!(gate.try_enter().await.unwrap());

        gate.exit().await.unwrap();

        assert_eq!(gate.state().await.unwrap().active_count, 0);
        assert!(gate.try_enter().await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_row_keeps_existing_cap() {
        let (store, gate) = gate();
        gate.ensure_row(3).await.unwrap();
        gate.ensure_row(10).await.unwrap();

        assert_eq!(gate.state().await.unwrap().max_count, 3);
        assert_eq!(store.entity_count(DEFAULT_STATE_TABLE), 1);
    }

    #[tokio::test]
    async fn test_missing_row_is_an_error() {
        let (_, gate) = gate();
        assert!(matches!(
            gate.try_enter().await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_falls_back_to_any_state_row() {
        let (store, gate) = gate();
        let record = WorkerStateRecord {
            active_count: 0,
            max_count: 1,
            update_date: Utc::now(),
        };
        store
            .insert(
                DEFAULT_STATE_TABLE,
                Entity::from_record("legacy", "row", &record).unwrap(),
            )
            .await
            .unwrap();

        assert!(gate.try_enter().await.unwrap());
        let stored = store.get(DEFAULT_STATE_TABLE, "legacy", "row").await.unwrap();
        assert_eq!(
            stored.to_record::<WorkerStateRecord>().unwrap().active_count,
            1
        );
    }
}
