//! Task model: identifiers, lifecycle state and the pollable status envelope.
//!
//! A task's state and its result/error live in one record written with one store
//! call, so a reader can never see a terminal status without its payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TaskError;
use crate::pipeline::stages::{StageInput, StageKind, StageOutput};

pub mod tracker;

pub use tracker::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id within `namespace`. Re-deriving the same label yields the
    /// same id, which makes re-enqueueing after a redelivery a no-op.
    pub fn derived(namespace: &Uuid, label: &str) -> Self {
        Self(Uuid::new_v5(namespace, label.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(Uuid);

impl PipelineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for PipelineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Payload-free view of `TaskState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// Lifecycle state. The result exists only in `Success`, the error only in `Failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started {
        attempt: u32,
    },
    Retry {
        next_attempt_at: DateTime<Utc>,
        last_error: TaskError,
    },
    Success {
        result: StageOutput,
    },
    Failure {
        error: TaskError,
    },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Started { .. } => TaskStatus::Started,
            TaskState::Retry { .. } => TaskStatus::Retry,
            TaskState::Success { .. } => TaskStatus::Success,
            TaskState::Failure { .. } => TaskStatus::Failure,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Terminal states are final. `Started -> Started` covers redelivery of a task
    /// whose worker died mid-execution.
    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskStatus::*;
        matches!(
            (self.status(), next.status()),
            (Pending, Started)
                | (Started, Started)
                | (Started, Retry)
                | (Started, Success)
                | (Started, Failure)
                | (Retry, Started)
        )
    }
}

/// Everything persisted about one task under `task:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: StageKind,
    pub pipeline_id: Option<PipelineId>,
    pub input: StageInput,
    pub state: TaskState,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Zero-based position of this stage within its chain.
    pub chain_position: u32,
    /// Stages still to run after this one, in order.
    pub successors: Vec<StageKind>,
    /// Set once the successor has been enqueued.
    pub next_task_id: Option<TaskId>,
    pub progress: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn result(&self) -> Option<&StageOutput> {
        match &self.state {
            TaskState::Success { result } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match &self.state {
            TaskState::Failure { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMeta {
    pub note: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub chain_position: u32,
    pub pipeline_id: Option<PipelineId>,
    pub next_task_id: Option<TaskId>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<TaskError>,
    pub updated_at: DateTime<Utc>,
}

/// What a poller sees. Built from a single record read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub task_id: TaskId,
    pub kind: StageKind,
    pub status: TaskStatus,
    pub result: Option<StageOutput>,
    pub error: Option<TaskError>,
    pub meta: ProgressMeta,
}

impl From<&TaskRecord> for StatusEnvelope {
    fn from(record: &TaskRecord) -> Self {
        let (next_attempt_at, last_error) = match &record.state {
            TaskState::Retry {
                next_attempt_at,
                last_error,
            } => (Some(*next_attempt_at), Some(last_error.clone())),
            _ => (None, None),
        };
        StatusEnvelope {
            task_id: record.id,
            kind: record.kind,
            status: record.status(),
            result: record.result().cloned(),
            error: record.error().cloned(),
            meta: ProgressMeta {
                note: record.progress.clone(),
                retry_count: record.retry_count,
                max_retries: record.max_retries,
                chain_position: record.chain_position,
                pipeline_id: record.pipeline_id,
                next_task_id: record.next_task_id,
                next_attempt_at,
                last_error,
                updated_at: record.updated_at,
            },
        }
    }
}
