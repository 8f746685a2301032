//! Counter persistence.
//!
//! The limiter never caches counts itself: every decision goes through a
//! [`CounterStore`], whose [`CounterStore::update`] is the single point where
//! a key's read-modify-write is serialized.

mod file;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::ratelimit::{RateLimitKey, RateLimitRecord};

/// Errors raised by counter stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store's update lock could not be acquired in time
    #[error("Timed out after {0:?} waiting for the store lock")]
    LockTimeout(Duration),

    /// Reading or writing the backing medium failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted state could not be decoded
    #[error("Persisted state is corrupt: {0}")]
    Corrupt(String),

    /// The store cannot serve requests at all
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A keyed, durable counter store with atomic per-key updates.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the record for a key.
    async fn get(&self, key: &RateLimitKey) -> StoreResult<Option<RateLimitRecord>>;

    /// Atomically read, transform and write the record for a key.
    ///
    /// `apply` receives the current record and returns the record to store,
    /// or `None` to leave the key untouched. No other update of the same key
    /// may interleave between the read and the write.
    async fn update(
        &self,
        key: &RateLimitKey,
        apply: &mut (dyn FnMut(Option<RateLimitRecord>) -> Option<RateLimitRecord> + Send),
    ) -> StoreResult<()>;

    /// Delete the record for a key. Returns whether one existed.
    async fn remove(&self, key: &RateLimitKey) -> StoreResult<bool>;

    /// Delete records of `operation` whose window started at or before `cutoff`.
    async fn purge_stale(&self, operation: &str, cutoff: i64) -> StoreResult<usize>;

    /// Number of records currently held.
    async fn len(&self) -> StoreResult<usize>;
}

/// Build the store selected in configuration.
pub fn build_store(config: &StorageConfig) -> Arc<dyn CounterStore> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory counter store");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::File => {
            info!(path = %config.path.display(), "Using file-backed counter store");
            Arc::new(FileStore::new(
                config.path.clone(),
                Duration::from_millis(config.lock_timeout_ms),
            ))
        }
    }
}
