//! Pipeline Orchestrator: turns `start` and `advance` calls into segment heads
//! on the broker.
//!
//! Stages inside a segment chain automatically through the worker pool. The
//! orchestrator only enqueues segment heads, and it derives each head's id from
//! the pipeline id and segment index, so a repeated `advance` can never put a
//! second copy of a segment on the queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::broker::{BrokerError, NewTask, TaskBroker};
use crate::errors::{ErrorKind, TaskError};
use crate::fetcher::reference::ResourceId;
use crate::pipeline::descriptor::PipelineDescriptor;
use crate::pipeline::stages::{JobSource, ResumeRef, StageInput, StageKind, StageOutput};
use crate::resume;
use crate::store::{get_json, keys, set_json, KvStore, StoreError};
use crate::tasks::{PipelineId, TaskId, TaskRecord, TaskState};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline '{0}' not found")]
    NotFound(String),

    #[error("resume text is empty")]
    EmptyResume,

    #[error("{0}")]
    InvalidReference(String),

    #[error("{0}")]
    Validation(String),

    #[error("pipeline is not at a checkpoint: {stage} task {task_id} is still running")]
    NotAtCheckpoint { stage: StageKind, task_id: TaskId },

    #[error("pipeline halted: {stage} task {task_id} failed with {error}")]
    Halted {
        stage: StageKind,
        task_id: TaskId,
        error: TaskError,
    },

    #[error("pipeline {0} has already completed")]
    Complete(PipelineId),

    #[error("task {0} of this pipeline has expired")]
    Expired(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifacts(#[from] ArtifactError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Persisted pipeline state. Task outcomes live in the tracker; the instance
/// only remembers which segment heads have been enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInstance {
    pub id: PipelineId,
    pub descriptor: PipelineDescriptor,
    pub segment_heads: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineInstance {
    /// Index of the most recently enqueued segment.
    fn current_segment(&self) -> usize {
        self.segment_heads.len().saturating_sub(1)
    }

    fn has_next_segment(&self) -> bool {
        self.segment_heads.len() < self.descriptor.segment_count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStarted {
    pub pipeline_id: PipelineId,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelinePhase {
    Running,
    /// The current segment finished and the next one waits for `advance`.
    AwaitingAdvance,
    Halted,
    Complete,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineView {
    pub pipeline_id: PipelineId,
    pub stages: Vec<StageKind>,
    pub segments: Vec<Vec<StageKind>>,
    pub segment_heads: Vec<TaskId>,
    pub current_segment: usize,
    pub phase: PipelinePhase,
    /// The task the phase refers to: running, failed, expired or last to succeed.
    pub current_task: Option<TaskId>,
    pub current_stage: Option<StageKind>,
    /// Output of the segment's last stage once it succeeded.
    pub result: Option<StageOutput>,
    pub error: Option<TaskError>,
}

/// Where a segment's chain currently stands.
enum SegmentState {
    Running { stage: StageKind, task_id: TaskId },
    Failed {
        stage: StageKind,
        task_id: TaskId,
        error: TaskError,
    },
    Succeeded(TaskRecord),
    Expired(TaskId),
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn KvStore>,
    broker: TaskBroker,
    artifacts: Arc<dyn ArtifactStore>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn KvStore>,
        broker: TaskBroker,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            store,
            broker,
            artifacts,
        }
    }

    /// Validates the inputs, then enqueues the first segment. Nothing is
    /// enqueued when the resume is empty or the job reference cannot resolve.
    /// An uploaded resume is read here, and its text becomes the extract input.
    pub async fn start(
        &self,
        resume: ResumeRef,
        job_source: &str,
    ) -> Result<PipelineStarted, PipelineError> {
        match &resume {
            ResumeRef::Text { text } if text.trim().is_empty() => {
                return Err(PipelineError::EmptyResume)
            }
            ResumeRef::Object { key } if key.trim().is_empty() => {
                return Err(PipelineError::Validation(
                    "resume object key must not be empty".to_string(),
                ))
            }
            _ => {}
        }
        if job_source.trim().is_empty() {
            return Err(PipelineError::Validation(
                "job_source must not be empty".to_string(),
            ));
        }

        let job = JobSource::classify(job_source);
        if let JobSource::Reference(raw) = &job {
            ResourceId::resolve(raw).map_err(|e| PipelineError::InvalidReference(e.to_string()))?;
        }
        let resume = self.load_resume(resume).await?;

        let descriptor = PipelineDescriptor::for_job_source(&job);
        let pipeline_id = PipelineId::new();
        let now = Utc::now();
        let mut instance = PipelineInstance {
            id: pipeline_id,
            descriptor,
            segment_heads: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let task_id = self
            .enqueue_segment(&mut instance, 0, StageInput::Extract { resume, job })
            .await?;
        info!(%pipeline_id, %task_id, stages = ?instance.descriptor.stages(), "pipeline started");
        Ok(PipelineStarted {
            pipeline_id,
            task_id,
        })
    }

    async fn load_resume(&self, resume: ResumeRef) -> Result<ResumeRef, PipelineError> {
        let ResumeRef::Object { key } = resume else {
            return Ok(resume);
        };
        let artifact = self.artifacts.get(&key).await.map_err(|e| match e {
            ArtifactError::NotFound(_) => PipelineError::InvalidReference(e.to_string()),
            other => PipelineError::Artifacts(other),
        })?;
        let text = resume::extract_text(&key, &artifact).map_err(|e| match e.kind {
            ErrorKind::EmptyResume => PipelineError::EmptyResume,
            _ => PipelineError::Validation(e.message),
        })?;
        Ok(ResumeRef::Text { text })
    }

    /// Enqueues the next segment once the current one has succeeded.
    ///
    /// Calling it again after the final segment was enqueued returns that
    /// segment's head id until the segment finishes.
    pub async fn advance(
        &self,
        pipeline_id: &PipelineId,
        additional_context: Vec<String>,
    ) -> Result<TaskId, PipelineError> {
        let mut instance = self.load(pipeline_id).await?;
        let head = self.current_head(&instance)?;

        match self.walk_segment(head).await? {
            SegmentState::Running { stage, task_id } => {
                if instance.has_next_segment() {
                    Err(PipelineError::NotAtCheckpoint { stage, task_id })
                } else {
                    Ok(head)
                }
            }
            SegmentState::Failed {
                stage,
                task_id,
                error,
            } => Err(PipelineError::Halted {
                stage,
                task_id,
                error,
            }),
            SegmentState::Expired(task_id) => Err(PipelineError::Expired(task_id)),
            SegmentState::Succeeded(_) if !instance.has_next_segment() => {
                Err(PipelineError::Complete(instance.id))
            }
            SegmentState::Succeeded(tail) => {
                let next_segment = instance.segment_heads.len();
                let output = tail.result().ok_or_else(|| {
                    PipelineError::Validation("segment tail has no result".to_string())
                })?;
                let input = segment_head_input(&instance, next_segment, output, additional_context)?;
                let task_id = self
                    .enqueue_segment(&mut instance, next_segment, input)
                    .await?;
                info!(%pipeline_id, %task_id, segment = next_segment, "pipeline advanced");
                Ok(task_id)
            }
        }
    }

    pub async fn inspect(&self, pipeline_id: &PipelineId) -> Result<PipelineView, PipelineError> {
        let instance = self.load(pipeline_id).await?;
        let head = self.current_head(&instance)?;

        let (phase, current_task, current_stage, result, error) =
            match self.walk_segment(head).await? {
                SegmentState::Running { stage, task_id } => {
                    (PipelinePhase::Running, Some(task_id), Some(stage), None, None)
                }
                SegmentState::Failed {
                    stage,
                    task_id,
                    error,
                } => (PipelinePhase::Halted, Some(task_id), Some(stage), None, Some(error)),
                SegmentState::Expired(task_id) => {
                    (PipelinePhase::Expired, Some(task_id), None, None, None)
                }
                SegmentState::Succeeded(tail) => {
                    let phase = if instance.has_next_segment() {
                        PipelinePhase::AwaitingAdvance
                    } else {
                        PipelinePhase::Complete
                    };
                    (phase, Some(tail.id), Some(tail.kind), tail.result().cloned(), None)
                }
            };

        Ok(PipelineView {
            pipeline_id: instance.id,
            stages: instance.descriptor.stages(),
            segments: instance.descriptor.segments().to_vec(),
            current_segment: instance.current_segment(),
            segment_heads: instance.segment_heads,
            phase,
            current_task,
            current_stage,
            result,
            error,
        })
    }

    /// Enqueues the head of `segment` under its derived id and records it on
    /// the instance. The instance is saved only after the head exists.
    async fn enqueue_segment(
        &self,
        instance: &mut PipelineInstance,
        segment: usize,
        input: StageInput,
    ) -> Result<TaskId, PipelineError> {
        let stages = instance.descriptor.segment(segment).ok_or_else(|| {
            PipelineError::Validation(format!("pipeline has no segment {segment}"))
        })?;
        let chain_position: usize = instance.descriptor.segments()[..segment]
            .iter()
            .map(Vec::len)
            .sum();

        let head_id = TaskId::derived(instance.id.as_uuid(), &format!("segment-{segment}"));
        let task_id = self
            .broker
            .enqueue(NewTask {
                id: Some(head_id),
                input,
                pipeline_id: Some(instance.id),
                successors: stages[1..].to_vec(),
                chain_position: chain_position as u32,
            })
            .await
            .map_err(|e| match e {
                BrokerError::InvalidPayload(message) => PipelineError::Validation(message),
                other => PipelineError::Broker(other),
            })?;

        if instance.segment_heads.len() == segment {
            instance.segment_heads.push(task_id);
        }
        instance.updated_at = Utc::now();
        set_json(
            self.store.as_ref(),
            &keys::pipeline(&instance.id.to_string()),
            &*instance,
            self.broker.settings().task_ttl,
        )
        .await?;
        Ok(task_id)
    }

    async fn load(&self, pipeline_id: &PipelineId) -> Result<PipelineInstance, PipelineError> {
        get_json(self.store.as_ref(), &keys::pipeline(&pipeline_id.to_string()))
            .await?
            .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))
    }

    fn current_head(&self, instance: &PipelineInstance) -> Result<TaskId, PipelineError> {
        instance
            .segment_heads
            .last()
            .copied()
            .ok_or_else(|| PipelineError::NotFound(instance.id.to_string()))
    }

    /// Follows `next_task_id` links from a segment head to the first task that
    /// has not succeeded, or to the segment's last task.
    async fn walk_segment(&self, head: TaskId) -> Result<SegmentState, PipelineError> {
        let tracker = self.broker.tracker();
        let mut id = head;
        loop {
            let Some(record) = tracker.find(&id).await? else {
                return Ok(SegmentState::Expired(id));
            };
            match &record.state {
                TaskState::Failure { error } => {
                    return Ok(SegmentState::Failed {
                        stage: record.kind,
                        task_id: record.id,
                        error: error.clone(),
                    })
                }
                TaskState::Success { .. } => match record.next_task_id {
                    Some(next) => id = next,
                    None if record.successors.is_empty() => {
                        return Ok(SegmentState::Succeeded(record))
                    }
                    None => {
                        return Ok(SegmentState::Running {
                            stage: record.successors[0],
                            task_id: record.id,
                        })
                    }
                },
                TaskState::Pending | TaskState::Started { .. } | TaskState::Retry { .. } => {
                    return Ok(SegmentState::Running {
                        stage: record.kind,
                        task_id: record.id,
                    })
                }
            }
        }
    }
}

/// Input for the head of `segment`, built from the previous segment's final output.
fn segment_head_input(
    instance: &PipelineInstance,
    segment: usize,
    previous: &StageOutput,
    additional_context: Vec<String>,
) -> Result<StageInput, PipelineError> {
    let kind = instance
        .descriptor
        .segment(segment)
        .and_then(|stages| stages.first().copied())
        .ok_or_else(|| PipelineError::Validation(format!("pipeline has no segment {segment}")))?;

    let additional_context: Vec<String> = additional_context
        .into_iter()
        .map(|chunk| chunk.trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect();

    let input = match kind {
        StageKind::Generate => StageInput::generate(previous, additional_context),
        other => StageInput::from_predecessor(other, previous),
    };
    input.map_err(|e| PipelineError::Validation(e.message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::tests::MemoryArtifacts;
    use crate::broker::retry::RetryPolicy;
    use crate::broker::worker::{ProgressReporter, StageExecutor, WorkerPool};
    use crate::broker::BrokerSettings;
    use crate::errors::ErrorKind;
    use crate::pipeline::ats::AtsReport;
    use crate::pipeline::stages::{JobOrigin, JobRecord};
    use crate::store::MemoryStore;
    use crate::structured::StructuredRecord;
    use crate::tasks::{TaskStatus, TaskTracker};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn score(score: u8) -> AtsReport {
        AtsReport {
            score,
            summary: "canned".into(),
            recommendations: vec![],
        }
    }

    /// Produces a plausible output for every stage; fails the configured one.
    #[derive(Default)]
    struct CannedExecutor {
        fail: Option<StageKind>,
        analyze_inputs: Mutex<Vec<JobRecord>>,
    }

    #[async_trait]
    impl StageExecutor for CannedExecutor {
        async fn execute(
            &self,
            task: &TaskRecord,
            _progress: &ProgressReporter,
        ) -> Result<StageOutput, TaskError> {
            if self.fail == Some(task.kind) {
                return Err(TaskError::new(ErrorKind::UnparseableOutput, "no brace block"));
            }
            Ok(match &task.input {
                StageInput::Extract { resume, job } => StageOutput::Extracted {
                    resume_text: match resume {
                        ResumeRef::Text { text } => text.clone(),
                        ResumeRef::Object { key } => format!("text of {key}"),
                    },
                    job: job.clone(),
                },
                StageInput::Scrape { resume_text, .. } => StageOutput::Scraped {
                    resume_text: resume_text.clone(),
                    job: JobRecord::from_structured(
                        StructuredRecord::try_from(json!({"title": "Rust engineer", "company": "Acme"}))
                            .unwrap(),
                        "Build services in Rust",
                        JobOrigin::Fetched {
                            url: "https://jobs.test/1".into(),
                        },
                    ),
                },
                StageInput::Analyze { resume_text, job } => {
                    self.analyze_inputs.lock().unwrap().push(job.clone());
                    StageOutput::Analyzed {
                        resume_text: resume_text.clone(),
                        job: job.clone(),
                        report: score(72),
                    }
                }
                StageInput::Generate {
                    job,
                    additional_context,
                    ..
                } => StageOutput::Generated {
                    job: job.clone(),
                    markdown: format!("# Jane Doe\n{}", additional_context.join("\n")),
                    markdown_key: format!("resumes/{}.md", task.id),
                },
                StageInput::Rescore {
                    markdown,
                    markdown_key,
                    ..
                } => StageOutput::Rescored {
                    markdown: markdown.clone(),
                    markdown_key: markdown_key.clone(),
                    report: score(91),
                },
                StageInput::Convert {
                    markdown,
                    markdown_key,
                    report,
                } => StageOutput::Converted {
                    document_key: format!("documents/{}.docx", task.id),
                    format: "docx".into(),
                    size_bytes: markdown.len() as u64,
                    markdown_key: markdown_key.clone(),
                    report: report.clone(),
                },
            })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        broker: TaskBroker,
        pool: WorkerPool,
        store: Arc<MemoryStore>,
    }

    fn harness(executor: Arc<CannedExecutor>) -> Harness {
        harness_with_uploads(executor, MemoryArtifacts::default())
    }

    fn harness_with_uploads(executor: Arc<CannedExecutor>, uploads: MemoryArtifacts) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let tracker = TaskTracker::new(store.clone(), Duration::from_secs(3600));
        let broker = TaskBroker::new(
            store.clone(),
            tracker,
            BrokerSettings {
                retry: RetryPolicy::new(Duration::ZERO, Duration::ZERO),
                ..BrokerSettings::default()
            },
        );
        Harness {
            orchestrator: Orchestrator::new(store.clone(), broker.clone(), Arc::new(uploads)),
            pool: WorkerPool::new(broker.clone(), executor, 1),
            broker,
            store,
        }
    }

    impl Harness {
        async fn drain(&self) {
            while self.pool.run_once().await.unwrap().is_some() {}
        }
    }

    fn resume() -> ResumeRef {
        ResumeRef::Text {
            text: "Jane Doe\nRust, Tokio, Postgres".into(),
        }
    }

    #[tokio::test]
    async fn test_empty_resume_never_enqueues() {
        let h = harness(Arc::default());
        let err = h
            .orchestrator
            .start(ResumeRef::Text { text: " \n".into() }, "Rust engineer")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResume));
        assert_eq!(h.store.list_len(keys::TASK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_blank_uploaded_resume_never_enqueues() {
        let uploads =
            MemoryArtifacts::default().with_object("uploads/blank.md", b" \n\t", "text/markdown");
        let h = harness_with_uploads(Arc::default(), uploads);
        let err = h
            .orchestrator
            .start(
                ResumeRef::Object {
                    key: "uploads/blank.md".into(),
                },
                "Rust engineer",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResume));
        assert_eq!(h.store.list_len(keys::TASK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_missing_upload_is_invalid_reference() {
        let h = harness(Arc::default());
        let err = h
            .orchestrator
            .start(
                ResumeRef::Object {
                    key: "uploads/gone.pdf".into(),
                },
                "Rust engineer",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidReference(_)));
        assert_eq!(h.store.list_len(keys::TASK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_uploaded_resume_text_is_handed_to_extract() {
        let uploads = MemoryArtifacts::default().with_object(
            "uploads/cv.txt",
            b"  Jane Doe\nRust  ",
            "text/plain",
        );
        let h = harness_with_uploads(Arc::default(), uploads);
        let started = h
            .orchestrator
            .start(
                ResumeRef::Object {
                    key: "uploads/cv.txt".into(),
                },
                "Rust engineer",
            )
            .await
            .unwrap();

        let head = h.broker.tracker().load(&started.task_id).await.unwrap();
        assert!(matches!(
            &head.input,
            StageInput::Extract { resume: ResumeRef::Text { text }, .. } if text == "Jane Doe\nRust"
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_reference_fails_without_enqueue() {
        let h = harness(Arc::default());
        let err = h.orchestrator.start(resume(), "https://").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidReference(_)));
        assert_eq!(h.store.list_len(keys::TASK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_not_found() {
        let h = harness(Arc::default());
        let err = h.orchestrator.inspect(&PipelineId::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_text_source_skips_scrape_and_stops_at_checkpoint() {
        let h = harness(Arc::default());
        let started = h
            .orchestrator
            .start(resume(), "Senior Rust engineer, remote, async services")
            .await
            .unwrap();
        h.drain().await;

        let view = h.orchestrator.inspect(&started.pipeline_id).await.unwrap();
        assert_eq!(
            view.stages,
            vec![
                StageKind::Extract,
                StageKind::Analyze,
                StageKind::Generate,
                StageKind::Rescore,
                StageKind::Convert
            ]
        );
        assert_eq!(view.phase, PipelinePhase::AwaitingAdvance);
        assert_eq!(view.segment_heads, vec![started.task_id]);
        assert!(matches!(view.result, Some(StageOutput::Analyzed { .. })));
    }

    #[tokio::test]
    async fn test_both_branches_feed_analysis_the_same_record_shape() {
        let executor = Arc::new(CannedExecutor::default());
        let h = harness(executor.clone());
        h.orchestrator
            .start(resume(), "https://www.linkedin.com/jobs/view/4150892998")
            .await
            .unwrap();
        h.orchestrator
            .start(resume(), "Rust engineer at Acme")
            .await
            .unwrap();
        h.drain().await;

        let inputs = executor.analyze_inputs.lock().unwrap().clone();
        assert_eq!(inputs.len(), 2);
        let shape = |record: &JobRecord| {
            let value = serde_json::to_value(record).unwrap();
            let mut keys: Vec<String> = value.as_object().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        };
        assert_eq!(shape(&inputs[0]), shape(&inputs[1]));
    }

    #[tokio::test]
    async fn test_advance_before_checkpoint_is_rejected() {
        let h = harness(Arc::default());
        let started = h.orchestrator.start(resume(), "Rust engineer").await.unwrap();

        let err = h
            .orchestrator
            .advance(&started.pipeline_id, vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NotAtCheckpoint { stage: StageKind::Extract, task_id } if task_id == started.task_id
        ));
    }

    #[tokio::test]
    async fn test_advance_is_idempotent_and_runs_to_completion() {
        let h = harness(Arc::default());
        let started = h.orchestrator.start(resume(), "Rust engineer").await.unwrap();
        h.drain().await;

        let context = vec!["Led the billing rewrite".to_string(), "  ".to_string()];
        let first = h
            .orchestrator
            .advance(&started.pipeline_id, context.clone())
            .await
            .unwrap();
        let second = h
            .orchestrator
            .advance(&started.pipeline_id, context)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.store.list_len(keys::TASK_QUEUE), 1);

        let head = h.broker.tracker().load(&first).await.unwrap();
        assert_eq!(head.chain_position, 2);
        assert!(matches!(
            &head.input,
            StageInput::Generate { additional_context, .. }
                if additional_context == &vec!["Led the billing rewrite".to_string()]
        ));

        h.drain().await;
        let view = h.orchestrator.inspect(&started.pipeline_id).await.unwrap();
        assert_eq!(view.phase, PipelinePhase::Complete);
        assert_eq!(view.current_stage, Some(StageKind::Convert));
        assert!(matches!(
            view.result,
            Some(StageOutput::Converted { ref report, .. }) if report.score == 91
        ));

        let err = h
            .orchestrator
            .advance(&started.pipeline_id, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Complete(id) if id == started.pipeline_id));
    }

    #[tokio::test]
    async fn test_failed_stage_halts_the_pipeline() {
        let h = harness(Arc::new(CannedExecutor {
            fail: Some(StageKind::Scrape),
            ..CannedExecutor::default()
        }));
        let started = h
            .orchestrator
            .start(resume(), "https://www.linkedin.com/jobs/view/42")
            .await
            .unwrap();
        h.drain().await;

        let view = h.orchestrator.inspect(&started.pipeline_id).await.unwrap();
        assert_eq!(view.phase, PipelinePhase::Halted);
        assert_eq!(view.current_stage, Some(StageKind::Scrape));
        assert_eq!(view.error.unwrap().kind, ErrorKind::UnparseableOutput);

        let err = h
            .orchestrator
            .advance(&started.pipeline_id, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Halted { stage: StageKind::Scrape, .. }));

        let scrape_id = h
            .broker
            .tracker()
            .load(&started.task_id)
            .await
            .unwrap()
            .next_task_id
            .unwrap();
        assert_eq!(
            h.broker.status_of(&scrape_id).await.unwrap(),
            Some(TaskStatus::Failure)
        );
    }
}
