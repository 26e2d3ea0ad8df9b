//! Persistence layer: the collaborators a worker talks to
//!
//! This module provides:
//! - [`EntityStore`] trait for the partition/row keyed table store
//! - [`DurableQueue`] trait for the at-least-once task queue
//! - [`BlobStore`] trait for chunked blob storage
//! - In-memory implementations of all three for testing and local runs

mod codec;
mod memory;
mod store;

pub use codec::{decode_message, encode_message};
pub use memory::{InMemoryBlobStore, InMemoryEntityStore, InMemoryQueue};
pub use store::{
    BatchOperation, BlobStore, ChunkStream, DurableQueue, Entity, EntityStore, QueueMessage,
    StoreError, INPUT_CONTAINER, MAX_BATCH_OPERATIONS, OUTPUT_CONTAINER,
};
