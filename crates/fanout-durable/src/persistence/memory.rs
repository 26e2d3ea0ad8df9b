//! In-memory implementations of the collaborator traits for testing

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::store::*;

type Table = BTreeMap<(String, String), Entity>;

/// In-memory implementation of [`EntityStore`]
///
/// Provides the same semantics a real table service would: duplicate inserts
/// fail, updates require an existing row, batches are size-limited, single
/// partition and atomic.
///
/// # Example
///
/// ```
/// use fanout_durable::InMemoryEntityStore;
///
/// let store = InMemoryEntityStore::new();
/// assert_eq!(store.entity_count("tasks"), 0);
/// ```
pub struct InMemoryEntityStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl InMemoryEntityStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of entities in a table
    pub fn entity_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.len())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.tables.write().clear();
    }

    fn not_found(table: &str, entity: &Entity) -> StoreError {
        StoreError::NotFound {
            table: table.to_string(),
            partition_key: entity.partition_key.clone(),
            row_key: entity.row_key.clone(),
        }
    }

    fn insert_into(table_name: &str, table: &mut Table, mut entity: Entity) -> Result<Entity, StoreError> {
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if table.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                table: table_name.to_string(),
                partition_key: entity.partition_key,
                row_key: entity.row_key,
            });
        }
        entity.version = 1;
        table.insert(key, entity.clone());
        Ok(entity)
    }

    fn replace_in(
        table_name: &str,
        table: &mut Table,
        mut entity: Entity,
        check_version: bool,
    ) -> Result<Entity, StoreError> {
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let stored = table
            .get_mut(&key)
            .ok_or_else(|| Self::not_found(table_name, &entity))?;

        if check_version && stored.version != entity.version {
            return Err(StoreError::ConcurrencyConflict {
                expected: entity.version,
                actual: stored.version,
            });
        }

        entity.version = stored.version + 1;
        *stored = entity.clone();
        Ok(entity)
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Entity, StoreError> {
        let tables = self.tables.read();
        tables
            .get(table)
            .and_then(|t| t.get(&(partition_key.to_string(), row_key.to_string())))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
            })
    }

    async fn insert(&self, table: &str, entity: Entity) -> Result<Entity, StoreError> {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        Self::insert_into(table, rows, entity)
    }

    async fn update(&self, table: &str, entity: Entity) -> Result<Entity, StoreError> {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        Self::replace_in(table, rows, entity, false)
    }

    async fn update_if_match(&self, table: &str, entity: Entity) -> Result<Entity, StoreError> {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        Self::replace_in(table, rows, entity, true)
    }

    async fn batch_commit(
        &self,
        table: &str,
        operations: Vec<BatchOperation>,
    ) -> Result<(), StoreError> {
        if operations.len() > MAX_BATCH_OPERATIONS {
            return Err(StoreError::BatchTooLarge {
                size: operations.len(),
                max: MAX_BATCH_OPERATIONS,
            });
        }
        if let Some(first) = operations.first() {
            let partition = &first.entity().partition_key;
            if operations
                .iter()
                .any(|op| &op.entity().partition_key != partition)
            {
                return Err(StoreError::MixedPartitionBatch);
            }
        }

        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();

        // Apply to a copy so a failing operation leaves the table untouched
        let mut staged = rows.clone();
        for operation in operations {
            match operation {
                BatchOperation::Insert(entity) => {
                    Self::insert_into(table, &mut staged, entity)?;
                }
                BatchOperation::Update(entity) => {
                    Self::replace_in(table, &mut staged, entity, false)?;
                }
            }
        }
        *rows = staged;
        Ok(())
    }

    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|e| e.partition_key == partition_key)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_table(&self, table: &str) -> Result<Vec<Entity>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Internal message state
struct StoredMessage {
    id: String,
    body: String,
    visible_at: Instant,
    dequeue_count: u32,
    pop_receipt: Option<String>,
}

/// In-memory implementation of [`DurableQueue`]
///
/// Received messages are hidden for the visibility timeout and redelivered if
/// they are not deleted in time, which gives at-least-once delivery.
pub struct InMemoryQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    /// Create a new queue with a 30 second visibility timeout
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    /// Create a new queue with a custom visibility timeout
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            visibility_timeout,
        }
    }

    /// Number of messages in the queue, visible or not
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether the queue holds no messages at all
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Number of messages that a receive would return right now
    pub fn visible_count(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.visible_at <= now)
            .count()
    }

    /// Bodies of all queued messages in order (for testing)
    pub fn bodies(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.body.clone()).collect()
    }

    fn push(&self, body: &str, visible_at: Instant) {
        self.messages.lock().push_back(StoredMessage {
            id: Uuid::now_v7().to_string(),
            body: body.to_string(),
            visible_at,
            dequeue_count: 0,
            pop_receipt: None,
        });
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, body: &str) -> Result<(), StoreError> {
        self.push(body, Instant::now());
        Ok(())
    }

    async fn enqueue_after(&self, body: &str, delay: Duration) -> Result<(), StoreError> {
        self.push(body, Instant::now() + delay);
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, StoreError> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut received = vec![];

        for message in messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }

            let pop_receipt = Uuid::now_v7().to_string();
            message.visible_at = now + self.visibility_timeout;
            message.dequeue_count += 1;
            message.pop_receipt = Some(pop_receipt.clone());

            received.push(QueueMessage {
                id: message.id.clone(),
                pop_receipt,
                body: message.body.clone(),
                dequeue_count: message.dequeue_count,
            });
        }

        Ok(received)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        let position = messages
            .iter()
            .position(|m| {
                m.id == message.id && m.pop_receipt.as_deref() == Some(message.pop_receipt.as_str())
            })
            .ok_or_else(|| StoreError::MessageNotFound(message.id.clone()))?;
        messages.remove(position);
        Ok(())
    }
}

/// In-memory implementation of [`BlobStore`]
///
/// Downloads are served in chunks of `chunk_size` bytes so consumers see the
/// same chunk boundaries a network download would produce.
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<(String, String), Arc<Vec<u8>>>>,
    chunk_size: usize,
}

impl InMemoryBlobStore {
    /// Create a new blob store serving 4 MiB chunks
    pub fn new() -> Self {
        Self::with_chunk_size(4 * 1024 * 1024)
    }

    /// Create a new blob store with a custom chunk size
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Store a blob synchronously (for seeding tests)
    pub fn put(&self, container: &str, name: &str, content: impl Into<Vec<u8>>) {
        self.blobs.write().insert(
            (container.to_string(), name.to_string()),
            Arc::new(content.into()),
        );
    }

    /// Read a blob synchronously (for assertions)
    pub fn get(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .get(&(container.to_string(), name.to_string()))
            .map(|content| content.as_ref().clone())
    }

    /// Sorted names of all blobs in a container
    pub fn names(&self, container: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .read()
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn download_chunks(
        &self,
        container: &str,
        name: &str,
    ) -> Result<ChunkStream, StoreError> {
        let content = self
            .blobs
            .read()
            .get(&(container.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound {
                container: container.to_string(),
                name: name.to_string(),
            })?;

        let chunks: Vec<Result<Vec<u8>, StoreError>> = content
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn upload(
        &self,
        container: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.put(container, name, content);
        Ok(())
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .blobs
            .read()
            .contains_key(&(container.to_string(), name.to_string())))
    }
}
