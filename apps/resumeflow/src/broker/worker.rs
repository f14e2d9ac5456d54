//! Worker pool: fixed number of slots, each executing one task at a time.
//!
//! Every outcome is classified and committed before the queue entry is
//! acknowledged. Panics inside a stage are caught and recorded as INTERNAL.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, NewTask, TaskBroker};
use crate::errors::TaskError;
use crate::pipeline::stages::{StageInput, StageOutput};
use crate::tasks::{TaskId, TaskRecord, TaskState, TaskTracker};

/// Label used to derive a successor's id from its predecessor's.
const SUCCESSOR_LABEL: &str = "successor";

/// Runs one stage. Implementations must be idempotent; delivery is at-least-once.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &TaskRecord,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, TaskError>;
}

/// Lets a running stage publish a short progress note to its status envelope.
pub struct ProgressReporter {
    tracker: TaskTracker,
    task_id: TaskId,
}

impl ProgressReporter {
    pub fn new(tracker: TaskTracker, task_id: TaskId) -> Self {
        Self { tracker, task_id }
    }

    pub async fn report(&self, note: &str) {
        self.tracker.set_progress(&self.task_id, note).await;
    }
}

/// Worker group handle.
/// - `request_shutdown` stops every worker from taking new tasks
/// - `shutdown_and_join` also waits for in-flight tasks to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

pub struct WorkerPool {
    broker: TaskBroker,
    executor: Arc<dyn StageExecutor>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(broker: TaskBroker, executor: Arc<dyn StageExecutor>, concurrency: usize) -> Self {
        Self {
            broker,
            executor,
            concurrency: concurrency.max(1),
        }
    }

    /// Spawns `concurrency` workers plus the delayed-retry promoter.
    pub fn spawn(self: Arc<Self>) -> WorkerGroup {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(self.concurrency + 1);
        for worker_id in 0..self.concurrency {
            let pool = Arc::clone(&self);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, &mut rx).await;
            }));
        }

        let pool = Arc::clone(&self);
        let mut rx = shutdown_rx;
        joins.push(tokio::spawn(async move {
            pool.promoter_loop(&mut rx).await;
        }));

        info!(workers = self.concurrency, "worker pool started");
        WorkerGroup { shutdown_tx, joins }
    }

    /// Promotes due retries, then processes at most one task. Returns the id handled.
    pub async fn run_once(&self) -> Result<Option<TaskId>, BrokerError> {
        self.broker.promote_due().await?;
        let Some(id) = self.broker.dequeue().await? else {
            return Ok(None);
        };
        self.process(id).await?;
        Ok(Some(id))
    }

    async fn worker_loop(&self, worker_id: usize, shutdown_rx: &mut watch::Receiver<bool>) {
        let idle = self.broker.settings().poll_interval;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.broker.dequeue().await {
                Ok(Some(id)) => {
                    if let Err(e) = self.process(id).await {
                        // The entry stays on the processing list and is redelivered at startup.
                        error!(worker_id, task_id = %id, "task processing aborted: {e}");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker_id, "dequeue failed: {e}"),
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }
        debug!(worker_id, "worker stopped");
    }

    async fn promoter_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let tick = self.broker.settings().poll_interval;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if let Err(e) = self.broker.promote_due().await {
                warn!("promoting delayed retries failed: {e}");
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    async fn process(&self, id: TaskId) -> Result<(), BrokerError> {
        let tracker = self.broker.tracker();
        let Some(mut record) = tracker.find(&id).await? else {
            warn!(task_id = %id, "queued task has no record, dropping");
            return self.broker.ack(&id).await;
        };
        if record.state.is_terminal() {
            debug!(task_id = %id, status = %record.status(), "redelivered finished task");
            return self.broker.ack(&id).await;
        }

        let attempt = record.retry_count + 1;
        tracker
            .commit(&mut record, TaskState::Started { attempt })
            .await?;
        info!(task_id = %id, kind = %record.kind, attempt, "task started");

        let next_state = match self.execute(&record).await {
            Ok(output) => match self.successor(&record, &output) {
                Ok(None) => TaskState::Success { result: output },
                Ok(Some(task)) => {
                    let next_kind = task.input.kind();
                    match self.broker.enqueue(task).await {
                        Ok(next_id) => {
                            debug!(task_id = %id, next_task_id = %next_id, next_kind = %next_kind, "successor enqueued");
                            record.next_task_id = Some(next_id);
                            TaskState::Success { result: output }
                        }
                        // The chain cannot continue, so the predecessor must not stay STARTED.
                        Err(e) => TaskState::Failure {
                            error: TaskError::internal(format!(
                                "could not enqueue {next_kind} stage: {e}"
                            )),
                        },
                    }
                }
                Err(error) => TaskState::Failure { error },
            },
            Err(error) if error.is_retryable() && record.retry_count < record.max_retries => {
                record.retry_count += 1;
                let delay = self.broker.settings().retry.jittered_delay(record.retry_count);
                let next_attempt_at =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                warn!(
                    task_id = %id,
                    kind = %record.kind,
                    retry = record.retry_count,
                    max_retries = record.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retry scheduled: {error}"
                );
                record.progress = Some("waiting to retry".to_string());
                tracker
                    .commit(
                        &mut record,
                        TaskState::Retry {
                            next_attempt_at,
                            last_error: error,
                        },
                    )
                    .await?;
                self.broker.schedule_retry(&id, delay).await?;
                return self.broker.ack(&id).await;
            }
            Err(error) => TaskState::Failure { error },
        };

        match &next_state {
            TaskState::Failure { error } => {
                error!(task_id = %id, kind = %record.kind, retry_count = record.retry_count, "task failed: {error}");
            }
            _ => info!(task_id = %id, kind = %record.kind, "task succeeded"),
        }
        record.progress = None;
        tracker.commit(&mut record, next_state).await?;
        self.broker.ack(&id).await
    }

    async fn execute(&self, record: &TaskRecord) -> Result<StageOutput, TaskError> {
        record.input.validate()?;
        let reporter = ProgressReporter::new(self.broker.tracker().clone(), record.id);

        let outcome = AssertUnwindSafe(self.executor.execute(record, &reporter))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(output)) if output.produced_by() == record.kind => Ok(output),
            Ok(Ok(output)) => Err(TaskError::internal(format!(
                "{} stage returned {} output",
                record.kind,
                output.produced_by()
            ))),
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(TaskError::internal(format!(
                "{} stage panicked: {}",
                record.kind,
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// The next task of the chain, with an id derived from this one so a
    /// re-executed predecessor never enqueues a second successor.
    fn successor(
        &self,
        record: &TaskRecord,
        output: &StageOutput,
    ) -> Result<Option<NewTask>, TaskError> {
        let Some((&next_kind, rest)) = record.successors.split_first() else {
            return Ok(None);
        };
        let input = StageInput::from_predecessor(next_kind, output)?;
        Ok(Some(NewTask {
            id: Some(TaskId::derived(record.id.as_uuid(), SUCCESSOR_LABEL)),
            input,
            pipeline_id: record.pipeline_id,
            successors: rest.to_vec(),
            chain_position: record.chain_position + 1,
        }))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
