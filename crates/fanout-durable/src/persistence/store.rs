//! Collaborator contracts: table store, durable queue and blob store

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};

/// Maximum number of operations accepted by a single batch commit
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// Container holding task input blobs (and child task chunks)
pub const INPUT_CONTAINER: &str = "input";

/// Container receiving task output blobs
pub const OUTPUT_CONTAINER: &str = "output";

/// Error type for collaborator operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity not found
    #[error("entity not found: {table}/{partition_key}/{row_key}")]
    NotFound {
        table: String,
        partition_key: String,
        row_key: String,
    },

    /// Entity already exists
    #[error("entity already exists: {table}/{partition_key}/{row_key}")]
    AlreadyExists {
        table: String,
        partition_key: String,
        row_key: String,
    },

    /// Concurrency conflict (optimistic update failed)
    #[error("concurrency conflict: expected version {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// Batch exceeds the per-commit operation limit
    #[error("batch of {size} operations exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// Batch spans more than one partition
    #[error("batch operations must share a single partition key")]
    MixedPartitionBatch,

    /// Blob not found
    #[error("blob not found: {container}/{name}")]
    BlobNotFound { container: String, name: String },

    /// Queue message not found (deleted or receipt expired)
    #[error("queue message not found: {0}")]
    MessageNotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error reports a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A row in the table store
///
/// Properties are a flat JSON object. `version` plays the role of an ETag:
/// stores bump it on every successful write and `update_if_match` compares it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub version: u64,
}

impl Entity {
    /// Create an empty entity
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            properties: serde_json::Map::new(),
            version: 0,
        }
    }

    /// Build an entity from a typed record
    pub fn from_record<T: Serialize>(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        record: &T,
    ) -> Result<Self, StoreError> {
        let mut entity = Self::new(partition_key, row_key);
        entity.replace_record(record)?;
        Ok(entity)
    }

    /// Deserialize the properties into a typed record
    pub fn to_record<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            self.properties.clone(),
        ))?)
    }

    /// Replace all properties with those of `record`, keeping keys and version
    pub fn replace_record<T: Serialize>(&mut self, record: &T) -> Result<(), StoreError> {
        match serde_json::to_value(record)? {
            serde_json::Value::Object(properties) => {
                self.properties = properties;
                Ok(())
            }
            other => Err(StoreError::Serialization(format!(
                "record must serialize to an object, got {other}"
            ))),
        }
    }

    /// Set a single property
    pub fn with_property(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    /// Get a single property
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

/// One operation inside a batch commit
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Insert(Entity),
    Update(Entity),
}

impl BatchOperation {
    pub fn entity(&self) -> &Entity {
        match self {
            Self::Insert(entity) | Self::Update(entity) => entity,
        }
    }
}

/// Partition/row keyed table store
///
/// Implementations must be thread-safe and tolerate concurrent access from
/// many worker processes.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Get a single entity
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Entity, StoreError>;

    /// Insert a new entity, failing if the key already exists
    async fn insert(&self, table: &str, entity: Entity) -> Result<Entity, StoreError>;

    /// Replace an existing entity unconditionally (last writer wins)
    async fn update(&self, table: &str, entity: Entity) -> Result<Entity, StoreError>;

    /// Replace an existing entity only if its stored version matches `entity.version`
    async fn update_if_match(&self, table: &str, entity: Entity) -> Result<Entity, StoreError>;

    /// Apply up to [`MAX_BATCH_OPERATIONS`] operations on one partition atomically
    async fn batch_commit(
        &self,
        table: &str,
        operations: Vec<BatchOperation>,
    ) -> Result<(), StoreError>;

    /// All entities of one partition
    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<Entity>, StoreError>;

    /// All entities of a table
    async fn query_table(&self, table: &str) -> Result<Vec<Entity>, StoreError>;
}

/// A message received from a [`DurableQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub pop_receipt: String,
    pub body: String,
    pub dequeue_count: u32,
}

/// At-least-once message queue
#[async_trait]
pub trait DurableQueue: Send + Sync + 'static {
    /// Append a message
    async fn enqueue(&self, body: &str) -> Result<(), StoreError>;

    /// Append a message that becomes visible after `delay`
    ///
    /// Backends without delayed visibility may deliver immediately.
    async fn enqueue_after(&self, body: &str, _delay: Duration) -> Result<(), StoreError> {
        self.enqueue(body).await
    }

    /// Receive up to `max_messages` visible messages
    ///
    /// Received messages stay hidden until deleted or their visibility expires.
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, StoreError>;

    /// Delete a received message
    async fn delete(&self, message: &QueueMessage) -> Result<(), StoreError>;
}

/// Lazily downloaded blob content
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, StoreError>>;

/// Chunked blob storage
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Download a blob as a stream of chunks
    async fn download_chunks(&self, container: &str, name: &str)
        -> Result<ChunkStream, StoreError>;

    /// Download a whole blob
    async fn download(&self, container: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let mut chunks = self.download_chunks(container, name).await?;
        let mut content = Vec::new();
        while let Some(chunk) = chunks.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(content)
    }

    /// Upload (or overwrite) a blob
    async fn upload(&self, container: &str, name: &str, content: Vec<u8>)
        -> Result<(), StoreError>;

    /// Check whether a blob exists
    async fn exists(&self, container: &str, name: &str) -> Result<bool, StoreError>;
}
