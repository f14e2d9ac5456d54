//! Task Broker: durable queue of task ids over the shared key-value store.
//!
//! A task record is persisted before its id is queued, so a dequeued id always
//! resolves. Dequeue moves the id onto a processing list; the id stays there
//! until the worker acknowledges it, and `recover_in_flight` puts anything left
//! over back on the queue at startup. Delivery is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::stages::{StageInput, StageKind};
use crate::store::{keys, KvStore, StoreError};
use crate::tasks::tracker::TrackerError;
use crate::tasks::{PipelineId, TaskId, TaskRecord, TaskState, TaskStatus, TaskTracker};

pub mod retry;
pub mod worker;

use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub max_retries: u32,
    pub retry: RetryPolicy,
    /// Retention of task records after their last write.
    pub task_ttl: Duration,
    /// Idle sleep between empty polls.
    pub poll_interval: Duration,
    /// Upper bound on delayed retries promoted per tick.
    pub promote_batch: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry: RetryPolicy::default(),
            task_ttl: Duration::from_secs(86_400),
            poll_interval: Duration::from_millis(200),
            promote_batch: 100,
        }
    }
}

/// Everything needed to enqueue one stage.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Deterministic ids make enqueueing idempotent; `None` draws a fresh one.
    pub id: Option<TaskId>,
    pub input: StageInput,
    pub pipeline_id: Option<PipelineId>,
    pub successors: Vec<StageKind>,
    pub chain_position: u32,
}

impl NewTask {
    pub fn new(input: StageInput) -> Self {
        Self {
            id: None,
            input,
            pipeline_id: None,
            successors: Vec::new(),
            chain_position: 0,
        }
    }
}

#[derive(Clone)]
pub struct TaskBroker {
    store: Arc<dyn KvStore>,
    tracker: TaskTracker,
    settings: BrokerSettings,
}

impl TaskBroker {
    pub fn new(store: Arc<dyn KvStore>, tracker: TaskTracker, settings: BrokerSettings) -> Self {
        Self {
            store,
            tracker,
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Persists the task as PENDING, then queues its id. Enqueueing an id that
    /// already exists returns it without queueing a second copy.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskId, BrokerError> {
        task.input
            .validate()
            .map_err(|e| BrokerError::InvalidPayload(e.message))?;

        let now = Utc::now();
        let record = TaskRecord {
            id: task.id.unwrap_or_default(),
            kind: task.input.kind(),
            pipeline_id: task.pipeline_id,
            input: task.input,
            state: TaskState::Pending,
            retry_count: 0,
            max_retries: self.settings.max_retries,
            chain_position: task.chain_position,
            successors: task.successors,
            next_task_id: None,
            progress: None,
            created_at: now,
            updated_at: now,
        };

        if !self.tracker.create(&record).await? {
            debug!(task_id = %record.id, "task already enqueued");
            return Ok(record.id);
        }
        self.store
            .push(keys::TASK_QUEUE, &record.id.to_string())
            .await?;
        info!(
            task_id = %record.id,
            kind = %record.kind,
            pipeline_id = ?record.pipeline_id,
            chain_position = record.chain_position,
            "task enqueued"
        );
        Ok(record.id)
    }

    /// Claims the oldest queued id, or `None` when the queue is empty.
    pub async fn dequeue(&self) -> Result<Option<TaskId>, BrokerError> {
        loop {
            let Some(raw) = self
                .store
                .try_pop(keys::TASK_QUEUE, keys::TASK_PROCESSING)
                .await?
            else {
                return Ok(None);
            };
            match raw.parse::<TaskId>() {
                Ok(id) => return Ok(Some(id)),
                Err(e) => {
                    warn!(entry = %raw, "dropping malformed queue entry: {e}");
                    self.store.ack(keys::TASK_PROCESSING, &raw).await?;
                }
            }
        }
    }

    pub async fn ack(&self, id: &TaskId) -> Result<(), BrokerError> {
        self.store
            .ack(keys::TASK_PROCESSING, &id.to_string())
            .await?;
        Ok(())
    }

    /// Parks `id` until `delay` has elapsed; `promote_due` re-queues it.
    pub async fn schedule_retry(&self, id: &TaskId, delay: Duration) -> Result<(), BrokerError> {
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.store
            .schedule(keys::TASK_DELAYED, &id.to_string(), due_ms)
            .await?;
        Ok(())
    }

    /// Moves delayed retries whose time has come back onto the queue.
    pub async fn promote_due(&self) -> Result<usize, BrokerError> {
        let due = self
            .store
            .take_due(
                keys::TASK_DELAYED,
                Utc::now().timestamp_millis(),
                self.settings.promote_batch,
            )
            .await?;
        for id in &due {
            self.store.push(keys::TASK_QUEUE, id).await?;
        }
        if !due.is_empty() {
            debug!(count = due.len(), "promoted delayed retries");
        }
        Ok(due.len())
    }

    /// Requeues ids that were claimed but never acknowledged, e.g. by a worker
    /// that died mid-task. Run once at startup before workers spawn.
    pub async fn recover_in_flight(&self) -> Result<usize, BrokerError> {
        let moved = self
            .store
            .requeue_processing(keys::TASK_PROCESSING, keys::TASK_QUEUE)
            .await?;
        if moved > 0 {
            info!(count = moved, "requeued in-flight tasks from a previous run");
        }
        Ok(moved)
    }

    /// Status of the task's record, if it still exists.
    pub async fn status_of(&self, id: &TaskId) -> Result<Option<TaskStatus>, BrokerError> {
        Ok(self.tracker.find(id).await?.map(|r| r.status()))
    }
}
