//! Key-value namespace shared by the cache, session store, task tracker and queue.
//!
//! Everything lives in one logical namespace partitioned by key prefix. Each value
//! carries its own TTL; lists and sorted sets back the durable task queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Longest TTL any backend will apply; longer requests are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Key layout. Every persisted key goes through one of these.
pub mod keys {
    pub const TASK_QUEUE: &str = "queue:tasks";
    pub const TASK_PROCESSING: &str = "queue:tasks:processing";
    pub const TASK_DELAYED: &str = "queue:tasks:delayed";

    pub fn cache(fingerprint: &str) -> String {
        format!("cache:{fingerprint}")
    }

    pub fn cache_claim(fingerprint: &str) -> String {
        format!("cache:{fingerprint}:claim")
    }

    pub fn session(id: &str) -> String {
        format!("session:{id}")
    }

    pub fn task(id: &str) -> String {
        format!("task:{id}")
    }

    pub fn pipeline(id: &str) -> String {
        format!("pipeline:{id}")
    }
}

/// The primitives every backend must provide. All mutation is single-key; the only
/// compare-and-set operations are `set_nx` and `delete_if_eq`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrites `key`. The TTL restarts on every write.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Writes only if `key` is absent. Returns whether this call created it.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Removes `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Appends to the tail end consumed by `try_pop`.
    async fn push(&self, queue: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically moves the oldest entry of `queue` into `processing` and returns it.
    async fn try_pop(&self, queue: &str, processing: &str) -> Result<Option<String>, StoreError>;

    /// Drops one occurrence of `value` from `processing`.
    async fn ack(&self, processing: &str, value: &str) -> Result<(), StoreError>;

    async fn schedule(&self, zset: &str, value: &str, due_ms: i64) -> Result<(), StoreError>;

    /// Atomically removes and returns up to `limit` members due at or before `now_ms`.
    async fn take_due(
        &self,
        zset: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Moves everything left in `processing` back onto `queue`.
    async fn requeue_processing(&self, processing: &str, queue: &str)
        -> Result<usize, StoreError>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

pub async fn set_json_nx<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<bool, StoreError> {
    let raw = serde_json::to_string(value)?;
    store.set_nx(key, &raw, ttl).await
}
