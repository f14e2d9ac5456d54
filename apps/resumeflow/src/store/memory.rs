//! Process-local `KvStore`. Used by tests and by `STORE_BACKEND=memory` runs.
//!
//! TTLs are measured on the tokio clock so paused-time tests can expire entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{KvStore, StoreError, MAX_TTL};

#[derive(Default)]
struct Inner {
    values: HashMap<String, (String, Instant)>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(i64, String)>>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(self.values.get(key), Some((_, expires_at)) if *expires_at <= Instant::now());
        if expired {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub fn list_len(&self, key: &str) -> usize {
        self.lock().lists.get(key).map(VecDeque::len).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn zset_len(&self, key: &str) -> usize {
        self.lock().zsets.get(key).map(Vec::len).unwrap_or(0)
    }
}

fn deadline_for(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().live_value(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock()
            .values
            .insert(key.to_string(), (value.to_string(), deadline_for(ttl)));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner
            .values
            .insert(key.to_string(), (value.to_string(), deadline_for(ttl)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let present = inner.live_value(key).is_some();
        inner.values.remove(key);
        Ok(present)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.live_value(key).map(String::as_str) == Some(expected) {
            inner.values.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn push(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .lists
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn try_pop(&self, queue: &str, processing: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        let Some(value) = inner.lists.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        inner
            .lists
            .entry(processing.to_string())
            .or_default()
            .push_back(value.clone());
        Ok(Some(value))
    }

    async fn ack(&self, processing: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(list) = inner.lists.get_mut(processing) {
            if let Some(pos) = list.iter().position(|v| v == value) {
                list.remove(pos);
            }
        }
        Ok(())
    }

    async fn schedule(&self, zset: &str, value: &str, due_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let members = inner.zsets.entry(zset.to_string()).or_default();
        members.retain(|(_, member)| member != value);
        members.push((due_ms, value.to_string()));
        Ok(())
    }

    async fn take_due(
        &self,
        zset: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        let Some(members) = inner.zsets.get_mut(zset) else {
            return Ok(Vec::new());
        };
        members.sort_by_key(|(score, _)| *score);
        let due = members
            .iter()
            .take_while(|(score, _)| *score <= now_ms)
            .take(limit)
            .count();
        Ok(members.drain(..due).map(|(_, member)| member).collect())
    }

    async fn requeue_processing(
        &self,
        processing: &str,
        queue: &str,
    ) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let pending: Vec<String> = inner
            .lists
            .get_mut(processing)
            .map(|list| list.drain(..).collect())
            .unwrap_or_default();
        let moved = pending.len();
        // In-flight entries were the oldest work, so they go back to the front.
        let target = inner.lists.entry(queue.to_string()).or_default();
        for value in pending.into_iter().rev() {
            target.push_front(value);
        }
        Ok(moved)
    }
}
