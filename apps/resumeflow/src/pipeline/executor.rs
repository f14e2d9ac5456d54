//! Stage handlers. Every expensive call goes through the response cache first,
//! and every handler is safe to run twice for the same task.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::artifacts::ArtifactStore;
use crate::broker::worker::{ProgressReporter, StageExecutor};
use crate::cache::{Fingerprint, ResponseCache};
use crate::convert::{DocumentConverter, DOCX_CONTENT_TYPE};
use crate::errors::{ErrorKind, TaskError};
use crate::fetcher::reference::ResourceId;
use crate::fetcher::Fetcher;
use crate::llm_client::{prompts, strip_code_fences, CompletionClient, CompletionRequest, LlmSettings};
use crate::pipeline::ats::AtsReport;
use crate::pipeline::stages::{JobOrigin, JobRecord, ResumeRef, StageInput, StageOutput};
use crate::resume;
use crate::structured::{self, StructuredRecord};
use crate::tasks::{TaskId, TaskRecord};

pub struct PipelineExecutor {
    cache: ResponseCache,
    llm: Arc<dyn CompletionClient>,
    llm_settings: LlmSettings,
    fetcher: Fetcher,
    artifacts: Arc<dyn ArtifactStore>,
    converter: Arc<dyn DocumentConverter>,
}

impl PipelineExecutor {
    pub fn new(
        cache: ResponseCache,
        llm: Arc<dyn CompletionClient>,
        llm_settings: LlmSettings,
        fetcher: Fetcher,
        artifacts: Arc<dyn ArtifactStore>,
        converter: Arc<dyn DocumentConverter>,
    ) -> Self {
        Self {
            cache,
            llm,
            llm_settings,
            fetcher,
            artifacts,
            converter,
        }
    }

    async fn extract(
        &self,
        resume: &ResumeRef,
        progress: &ProgressReporter,
    ) -> Result<String, TaskError> {
        let text = match resume {
            ResumeRef::Text { text } => text.trim().to_string(),
            ResumeRef::Object { key } => {
                progress.report("extracting resume text").await;
                let artifact = self.artifacts.get(key).await?;
                resume::extract_text(key, &artifact)?
            }
        };
        if text.is_empty() {
            return Err(TaskError::new(ErrorKind::EmptyResume, "resume text is empty"));
        }
        Ok(text)
    }

    async fn scrape(
        &self,
        reference: &str,
        progress: &ProgressReporter,
    ) -> Result<JobRecord, TaskError> {
        let id = ResourceId::resolve(reference)
            .map_err(|e| TaskError::new(ErrorKind::InvalidReference, e.to_string()))?;

        progress.report("fetching posting").await;
        let payload = self
            .fetcher
            .fetch_all(std::slice::from_ref(&id))
            .await
            .remove(&id)
            .ok_or_else(|| TaskError::internal(format!("fetcher returned no entry for {id}")))??;

        progress.report("structuring posting").await;
        let request = self
            .llm_settings
            .scoring_request(prompts::build_structure_prompt(&payload.text));
        let details = self.structured_completion(&request, Ok).await?;

        Ok(JobRecord::from_structured(
            details,
            &payload.text,
            JobOrigin::Fetched {
                url: payload.source_url,
            },
        ))
    }

    /// ATS report for the resume and job embedded in `prompt`.
    async fn score(
        &self,
        prompt: String,
        progress: &ProgressReporter,
    ) -> Result<AtsReport, TaskError> {
        progress.report("scoring resume").await;
        let request = self.llm_settings.scoring_request(prompt);
        self.structured_completion(&request, |record| AtsReport::from_record(&record))
            .await
    }

    async fn generate(
        &self,
        task_id: &TaskId,
        job: &JobRecord,
        request: CompletionRequest,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, TaskError> {
        progress.report("awaiting completion").await;
        let raw = self.completion(&request).await?;
        let markdown = strip_code_fences(&raw).to_string();
        if markdown.is_empty() {
            return Err(TaskError::new(
                ErrorKind::ExternalRejected,
                "completion returned an empty resume",
            ));
        }

        progress.report("storing markdown").await;
        let markdown_key = format!("resumes/{task_id}.md");
        self.artifacts
            .put(&markdown_key, Bytes::from(markdown.clone()), "text/markdown")
            .await?;
        Ok(StageOutput::Generated {
            job: job.clone(),
            markdown,
            markdown_key,
        })
    }

    async fn convert(
        &self,
        task_id: &TaskId,
        markdown: &str,
        markdown_key: &str,
        report: &AtsReport,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, TaskError> {
        progress.report("converting document").await;
        let document = self.converter.convert(markdown).await?;
        let format = self.converter.format().to_string();
        let content_type = if format == "docx" {
            DOCX_CONTENT_TYPE
        } else {
            "application/octet-stream"
        };

        let document_key = format!("documents/{task_id}.{format}");
        let size_bytes = document.len() as u64;
        self.artifacts
            .put(&document_key, document, content_type)
            .await?;
        info!(%task_id, %document_key, size_bytes, "document stored");
        Ok(StageOutput::Converted {
            document_key,
            format,
            size_bytes,
            markdown_key: markdown_key.to_string(),
            report: report.clone(),
        })
    }

    /// Completion text, cached under the full request fingerprint.
    async fn completion(&self, request: &CompletionRequest) -> Result<String, TaskError> {
        let settings = self.cache.settings();
        if !settings.llm_enabled {
            return self.call(request).await;
        }
        self.cache
            .get_or_compute(
                &Fingerprint::for_completion(request),
                settings.llm_ttl,
                || self.call(request),
            )
            .await
    }

    /// Completion parsed into a record and read by `interpret`. Only a
    /// successful read is cached, so unparseable output is requested afresh
    /// next time.
    async fn structured_completion<T, F>(
        &self,
        request: &CompletionRequest,
        interpret: F,
    ) -> Result<T, TaskError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(StructuredRecord) -> Result<T, TaskError> + Sync,
    {
        let compute = || async {
            let raw = self.call(request).await?;
            interpret(structured::parse(&raw)?)
        };
        let settings = self.cache.settings();
        if !settings.llm_enabled {
            return compute().await;
        }
        self.cache
            .get_or_compute(
                &Fingerprint::for_structured(request),
                settings.llm_ttl,
                compute,
            )
            .await
    }

    async fn call(&self, request: &CompletionRequest) -> Result<String, TaskError> {
        debug!(model = %request.model, prompt_chars = request.prompt.len(), "requesting completion");
        Ok(self.llm.complete(request).await?)
    }
}

#[async_trait]
impl StageExecutor for PipelineExecutor {
    async fn execute(
        &self,
        task: &TaskRecord,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, TaskError> {
        match &task.input {
            StageInput::Extract { resume, job } => Ok(StageOutput::Extracted {
                resume_text: self.extract(resume, progress).await?,
                job: job.clone(),
            }),
            StageInput::Scrape {
                resume_text,
                reference,
            } => Ok(StageOutput::Scraped {
                resume_text: resume_text.clone(),
                job: self.scrape(reference, progress).await?,
            }),
            StageInput::Analyze { resume_text, job } => {
                let prompt = prompts::build_analysis_prompt(&job.to_prompt_value(), resume_text);
                Ok(StageOutput::Analyzed {
                    resume_text: resume_text.clone(),
                    job: job.clone(),
                    report: self.score(prompt, progress).await?,
                })
            }
            StageInput::Generate {
                resume_text,
                job,
                report,
                additional_context,
            } => {
                let request = self.llm_settings.request(prompts::build_generation_prompt(
                    &job.to_prompt_value(),
                    resume_text,
                    &report.to_prompt_text(),
                    additional_context,
                ));
                self.generate(&task.id, job, request, progress).await
            }
            StageInput::Rescore {
                job,
                markdown,
                markdown_key,
            } => {
                let prompt = prompts::build_rescore_prompt(&job.to_prompt_value(), markdown);
                let report = self.score(prompt, progress).await?;
                info!(task_id = %task.id, score = report.score, "generated resume rescored");
                Ok(StageOutput::Rescored {
                    markdown: markdown.clone(),
                    markdown_key: markdown_key.clone(),
                    report,
                })
            }
            StageInput::Convert {
                markdown,
                markdown_key,
                report,
            } => {
                self.convert(&task.id, markdown, markdown_key, report, progress)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::tests::MemoryArtifacts;
    use crate::cache::CacheSettings;
    use crate::convert::tests::StubConverter;
    use crate::fetcher::tests::StubTransport;
    use crate::fetcher::FetcherSettings;
    use crate::llm_client::LlmError;
    use crate::pipeline::stages::{JobSource, StageKind};
    use crate::store::MemoryStore;
    use crate::tasks::tracker::tests::pending_record;
    use crate::tasks::TaskTracker;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays queued replies, then repeats `fallback`.
    struct StubCompletion {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        fallback: String,
        prompts: Mutex<Vec<String>>,
        temperatures: Mutex<Vec<f32>>,
        calls: AtomicUsize,
    }

    impl StubCompletion {
        fn new(fallback: &str) -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                fallback: fallback.to_string(),
                prompts: Mutex::new(Vec::new()),
                temperatures: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn then(self, reply: Result<String, LlmError>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }
    }

    #[async_trait]
    impl CompletionClient for StubCompletion {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.temperatures.lock().unwrap().push(request.temperature);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    struct Harness {
        executor: PipelineExecutor,
        llm: Arc<StubCompletion>,
        artifacts: Arc<MemoryArtifacts>,
        progress: ProgressReporter,
    }

    fn harness(llm: StubCompletion, transport: StubTransport, artifacts: MemoryArtifacts) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), CacheSettings::default());
        let fetcher = Fetcher::new(
            Arc::new(transport),
            cache.clone(),
            FetcherSettings {
                base_url: "https://jobs.test".to_string(),
                timeout: Duration::from_secs(5),
                ..FetcherSettings::default()
            },
        );
        let llm = Arc::new(llm);
        let artifacts = Arc::new(artifacts);
        let tracker = TaskTracker::new(store, Duration::from_secs(3600));
        Harness {
            executor: PipelineExecutor::new(
                cache,
                llm.clone(),
                LlmSettings::default(),
                fetcher,
                artifacts.clone(),
                Arc::new(StubConverter),
            ),
            llm,
            artifacts,
            progress: ProgressReporter::new(tracker, TaskId::new()),
        }
    }

    fn task(input: StageInput) -> TaskRecord {
        TaskRecord {
            kind: input.kind(),
            input,
            ..pending_record(StageKind::Extract)
        }
    }

    fn job() -> JobRecord {
        JobRecord::from_text("Senior Rust engineer, async services")
    }

    #[tokio::test]
    async fn test_extract_reads_uploaded_resume() {
        let h = harness(
            StubCompletion::new(""),
            StubTransport::default(),
            MemoryArtifacts::default().with_object("uploads/cv.md", b"# Jane Doe\nRust", "text/markdown"),
        );
        let input = StageInput::Extract {
            resume: ResumeRef::Object {
                key: "uploads/cv.md".into(),
            },
            job: JobSource::Text("Rust engineer".into()),
        };
        let output = h.executor.execute(&task(input), &h.progress).await.unwrap();
        assert!(matches!(
            output,
            StageOutput::Extracted { resume_text, .. } if resume_text == "# Jane Doe\nRust"
        ));
    }

    #[tokio::test]
    async fn test_extract_of_missing_object_is_invalid_reference() {
        let h = harness(
            StubCompletion::new(""),
            StubTransport::default(),
            MemoryArtifacts::default(),
        );
        let input = StageInput::Extract {
            resume: ResumeRef::Object {
                key: "uploads/missing.pdf".into(),
            },
            job: JobSource::Text("Rust engineer".into()),
        };
        let err = h.executor.execute(&task(input), &h.progress).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidReference);
    }

    #[tokio::test]
    async fn test_scrape_repairs_model_output_into_job_record() {
        let page = "https://jobs.test/jobs-guest/jobs/api/jobPosting/42";
        let h = harness(
            StubCompletion::new(
                "Sure! Here it is:\n{title: \"Rust engineer\", company: \"Acme\", salary: 120,000,}",
            ),
            StubTransport::default().with_page(page, Ok("<p>Rust engineer at Acme</p>".into())),
            MemoryArtifacts::default(),
        );
        let input = StageInput::Scrape {
            resume_text: "Jane".into(),
            reference: "https://www.linkedin.com/jobs/view/42".into(),
        };
        let output = h.executor.execute(&task(input), &h.progress).await.unwrap();

        let StageOutput::Scraped { job, .. } = output else {
            panic!("expected scraped output");
        };
        assert_eq!(job.title.as_deref(), Some("Rust engineer"));
        assert_eq!(job.company.as_deref(), Some("Acme"));
        assert_eq!(job.details.get("salary"), Some(&serde_json::json!(120000)));
        assert_eq!(job.origin, JobOrigin::Fetched { url: page.into() });
        assert_eq!(job.description, "Rust engineer at Acme");
    }

    #[tokio::test]
    async fn test_unparseable_structuring_is_not_cached() {
        let page = "https://jobs.test/jobs-guest/jobs/api/jobPosting/7";
        let h = harness(
            StubCompletion::new("I could not find a job posting."),
            StubTransport::default().with_page(page, Ok("<p>Posting</p>".into())),
            MemoryArtifacts::default(),
        );
        let input = StageInput::Scrape {
            resume_text: "Jane".into(),
            reference: "7".into(),
        };
        for _ in 0..2 {
            let err = h
                .executor
                .execute(&task(input.clone()), &h.progress)
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::UnparseableOutput);
        }
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    }

    fn report(score: u8) -> AtsReport {
        AtsReport {
            score,
            summary: "Rust fits, Kubernetes missing".into(),
            recommendations: vec!["Mention Kubernetes".into()],
        }
    }

    #[tokio::test]
    async fn test_analysis_is_a_structured_report_served_from_cache_on_rerun() {
        let h = harness(
            StubCompletion::new(
                "```json\n{\"score\": 64, \"summary\": \"Rust fits, Kubernetes missing\", \"recommendations\": [\"Mention Kubernetes\"]}\n```",
            ),
            StubTransport::default(),
            MemoryArtifacts::default(),
        );
        let input = StageInput::Analyze {
            resume_text: "Jane Doe, Rust".into(),
            job: job(),
        };
        for _ in 0..2 {
            let output = h
                .executor
                .execute(&task(input.clone()), &h.progress)
                .await
                .unwrap();
            assert!(matches!(
                output,
                StageOutput::Analyzed { report: r, .. } if r == report(64)
            ));
        }
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
        let prompt = h.llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("### Existing Resume:\nJane Doe, Rust"));
        assert_eq!(h.llm.temperatures.lock().unwrap()[0], 0.1);
    }

    #[tokio::test]
    async fn test_analysis_without_score_is_unparseable_and_not_cached() {
        let h = harness(
            StubCompletion::new("{\"summary\": \"Looks good\"}"),
            StubTransport::default(),
            MemoryArtifacts::default(),
        );
        let input = StageInput::Analyze {
            resume_text: "Jane".into(),
            job: job(),
        };
        for _ in 0..2 {
            let err = h
                .executor
                .execute(&task(input.clone()), &h.progress)
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::UnparseableOutput);
        }
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rescore_scores_the_generated_markdown() {
        let h = harness(
            StubCompletion::new("{score: 88, summary: \"Much closer\", recommendations: [],}"),
            StubTransport::default(),
            MemoryArtifacts::default(),
        );
        let input = StageInput::Rescore {
            job: job(),
            markdown: "# Jane Doe\n- Kubernetes".into(),
            markdown_key: "resumes/1.md".into(),
        };
        let output = h.executor.execute(&task(input), &h.progress).await.unwrap();
        let StageOutput::Rescored {
            markdown_key,
            report,
            ..
        } = output
        else {
            panic!("expected rescored output");
        };
        assert_eq!(markdown_key, "resumes/1.md");
        assert_eq!(report.score, 88);
        assert!(report.recommendations.is_empty());
        let prompt = h.llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("### Existing Resume:\n# Jane Doe\n- Kubernetes"));
        assert!(prompt.contains("has been rewritten"));
    }

    #[tokio::test]
    async fn test_transient_completion_failure_is_retryable() {
        let h = harness(
            StubCompletion::new("ok").then(Err(LlmError::Api {
                status: 503,
                message: "overloaded".into(),
            })),
            StubTransport::default(),
            MemoryArtifacts::default(),
        );
        let input = StageInput::Analyze {
            resume_text: "Jane".into(),
            job: job(),
        };
        let err = h.executor.execute(&task(input), &h.progress).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_generate_then_convert_stores_both_artifacts() {
        let h = harness(
            StubCompletion::new("```markdown\n# Jane Doe\n- Rust\n```"),
            StubTransport::default(),
            MemoryArtifacts::default(),
        );
        let generate = task(StageInput::Generate {
            resume_text: "Jane".into(),
            job: job(),
            report: report(64),
            additional_context: vec!["Maintainer of an async runtime".into()],
        });
        let output = h.executor.execute(&generate, &h.progress).await.unwrap();
        let StageOutput::Generated {
            job: carried,
            markdown,
            markdown_key,
        } = output
        else {
            panic!("expected generated output");
        };
        assert_eq!(carried, job());
        assert_eq!(markdown, "# Jane Doe\n- Rust");
        assert_eq!(markdown_key, format!("resumes/{}.md", generate.id));
        let prompt = h.llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Maintainer of an async runtime"));
        assert!(prompt.contains("### ATS Analysis:\nScore: 64/100"));
        assert_eq!(h.llm.temperatures.lock().unwrap()[0], 0.7);

        let convert = task(StageInput::Convert {
            markdown: markdown.clone(),
            markdown_key: markdown_key.clone(),
            report: report(90),
        });
        let output = h.executor.execute(&convert, &h.progress).await.unwrap();
        let StageOutput::Converted {
            document_key,
            format,
            size_bytes,
            markdown_key: carried_key,
            report: improved,
        } = output
        else {
            panic!("expected converted output");
        };
        assert_eq!(format, "docx");
        assert_eq!(size_bytes, format!("DOCX:{markdown}").len() as u64);
        assert_eq!(carried_key, markdown_key);
        assert_eq!(improved.score, 90);
        assert_eq!(h.artifacts.keys(), vec![document_key, markdown_key]);
    }
}
