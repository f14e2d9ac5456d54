use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::store::{get_json, keys, set_json, set_json_nx, KvStore, StoreError};
use crate::tasks::{StatusEnvelope, TaskId, TaskRecord, TaskState, TaskStatus};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("task '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("illegal task transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },
}

/// Authoritative lifecycle and result store for every task id.
///
/// Every write replaces the whole record and restarts its retention TTL.
#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<dyn KvStore>,
    retention: Duration,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn KvStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Persists a fresh record unless one already exists. Returns whether it was created.
    pub async fn create(&self, record: &TaskRecord) -> Result<bool, StoreError> {
        set_json_nx(
            self.store.as_ref(),
            &keys::task(&record.id.to_string()),
            record,
            self.retention,
        )
        .await
    }

    pub async fn find(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        get_json(self.store.as_ref(), &keys::task(&id.to_string())).await
    }

    pub async fn load(&self, id: &TaskId) -> Result<TaskRecord, TrackerError> {
        self.find(id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    /// Moves `record` to `next` and writes it in one store call. On failure the
    /// in-memory record keeps its previous state.
    pub async fn commit(&self, record: &mut TaskRecord, next: TaskState) -> Result<(), TrackerError> {
        if !record.state.can_transition_to(&next) {
            return Err(TrackerError::IllegalTransition {
                from: record.status(),
                to: next.status(),
            });
        }
        let previous = std::mem::replace(&mut record.state, next);
        let previous_updated_at = record.updated_at;
        record.updated_at = Utc::now();

        if let Err(e) = self.write(record).await {
            record.state = previous;
            record.updated_at = previous_updated_at;
            return Err(e.into());
        }
        Ok(())
    }

    /// Best-effort progress note on a running task.
    pub async fn set_progress(&self, id: &TaskId, note: &str) {
        let result: Result<(), StoreError> = async {
            let Some(mut record) = self.find(id).await? else {
                return Ok(());
            };
            if record.status() != TaskStatus::Started {
                return Ok(());
            }
            record.progress = Some(note.to_string());
            record.updated_at = Utc::now();
            self.write(&record).await
        }
        .await;
        if let Err(e) = result {
            warn!(task_id = %id, "progress update failed: {e}");
        }
    }

    pub async fn get_status(&self, id: &TaskId) -> Result<StatusEnvelope, TrackerError> {
        let record = self.load(id).await?;
        Ok(StatusEnvelope::from(&record))
    }

    async fn write(&self, record: &TaskRecord) -> Result<(), StoreError> {
        set_json(
            self.store.as_ref(),
            &keys::task(&record.id.to_string()),
            record,
            self.retention,
        )
        .await
    }
}
