//! Stage kinds and the tagged payloads passed between them.
//!
//! Every hand-off goes through `StageInput::from_predecessor`, which rejects any
//! output a stage cannot accept.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorKind, TaskError};
use crate::fetcher::reference::looks_like_reference;
use crate::pipeline::ats::AtsReport;
use crate::structured::StructuredRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Extract,
    Scrape,
    Analyze,
    Generate,
    Rescore,
    Convert,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Extract => "extract",
            StageKind::Scrape => "scrape",
            StageKind::Analyze => "analyze",
            StageKind::Generate => "generate",
            StageKind::Rescore => "rescore",
            StageKind::Convert => "convert",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the resume comes from: pasted text or an uploaded object in the artifact store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumeRef {
    Text { text: String },
    Object { key: String },
}

/// The job side of a pipeline: a reference to fetch, or the description itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobSource {
    Reference(String),
    Text(String),
}

impl JobSource {
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if looks_like_reference(trimmed) {
            JobSource::Reference(trimmed.to_string())
        } else {
            JobSource::Text(trimmed.to_string())
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, JobSource::Reference(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOrigin {
    Fetched { url: String },
    Supplied,
}

/// Normalized job description. Both the fetched and the supplied branch produce
/// this same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub title: Option<String>,
    pub company: Option<String>,
    pub description: String,
    pub details: StructuredRecord,
    pub origin: JobOrigin,
}

impl JobRecord {
    /// Supplied text. A JSON object is taken as already-structured details.
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| StructuredRecord::try_from(v).ok())
        {
            Some(details) => Self::from_structured(details, text.trim(), JobOrigin::Supplied),
            None => JobRecord {
                title: None,
                company: None,
                description: text.trim().to_string(),
                details: StructuredRecord::default(),
                origin: JobOrigin::Supplied,
            },
        }
    }

    pub fn from_structured(details: StructuredRecord, description: &str, origin: JobOrigin) -> Self {
        JobRecord {
            title: details
                .first_str(&["title", "job_title", "position"])
                .map(str::to_string),
            company: details
                .first_str(&["company", "company_name", "organization"])
                .map(str::to_string),
            description: description.to_string(),
            details,
            origin,
        }
    }

    /// JSON embedded in prompts.
    pub fn to_prompt_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageInput {
    Extract {
        resume: ResumeRef,
        job: JobSource,
    },
    Scrape {
        resume_text: String,
        reference: String,
    },
    Analyze {
        resume_text: String,
        job: JobRecord,
    },
    Generate {
        resume_text: String,
        job: JobRecord,
        report: AtsReport,
        additional_context: Vec<String>,
    },
    Rescore {
        job: JobRecord,
        markdown: String,
        markdown_key: String,
    },
    Convert {
        markdown: String,
        markdown_key: String,
        report: AtsReport,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    Extracted {
        resume_text: String,
        job: JobSource,
    },
    Scraped {
        resume_text: String,
        job: JobRecord,
    },
    Analyzed {
        resume_text: String,
        job: JobRecord,
        report: AtsReport,
    },
    Generated {
        job: JobRecord,
        markdown: String,
        markdown_key: String,
    },
    /// The generated resume scored against the same job.
    Rescored {
        markdown: String,
        markdown_key: String,
        report: AtsReport,
    },
    Converted {
        document_key: String,
        format: String,
        size_bytes: u64,
        markdown_key: String,
        report: AtsReport,
    },
}

impl StageOutput {
    /// The stage that produces this variant.
    pub fn produced_by(&self) -> StageKind {
        match self {
            StageOutput::Extracted { .. } => StageKind::Extract,
            StageOutput::Scraped { .. } => StageKind::Scrape,
            StageOutput::Analyzed { .. } => StageKind::Analyze,
            StageOutput::Generated { .. } => StageKind::Generate,
            StageOutput::Rescored { .. } => StageKind::Rescore,
            StageOutput::Converted { .. } => StageKind::Convert,
        }
    }
}

impl StageInput {
    pub fn kind(&self) -> StageKind {
        match self {
            StageInput::Extract { .. } => StageKind::Extract,
            StageInput::Scrape { .. } => StageKind::Scrape,
            StageInput::Analyze { .. } => StageKind::Analyze,
            StageInput::Generate { .. } => StageKind::Generate,
            StageInput::Rescore { .. } => StageKind::Rescore,
            StageInput::Convert { .. } => StageKind::Convert,
        }
    }

    /// Shape checks run before a stage executes.
    pub fn validate(&self) -> Result<(), TaskError> {
        fn non_empty(field: &str, value: &str) -> Result<(), TaskError> {
            if value.trim().is_empty() {
                return Err(TaskError::validation(format!("{field} must not be empty")));
            }
            Ok(())
        }

        match self {
            StageInput::Extract { resume, job } => {
                match resume {
                    ResumeRef::Text { text } if text.trim().is_empty() => {
                        return Err(TaskError::new(
                            ErrorKind::EmptyResume,
                            "resume text is empty",
                        ));
                    }
                    ResumeRef::Object { key } => non_empty("resume object key", key)?,
                    ResumeRef::Text { .. } => {}
                }
                match job {
                    JobSource::Reference(r) => non_empty("job reference", r),
                    JobSource::Text(t) => non_empty("job description", t),
                }
            }
            StageInput::Scrape {
                resume_text,
                reference,
            } => {
                non_empty("resume_text", resume_text)?;
                non_empty("reference", reference)
            }
            StageInput::Analyze { resume_text, job } => {
                non_empty("resume_text", resume_text)?;
                non_empty("job description", &job.description)
            }
            StageInput::Generate {
                resume_text, job, ..
            } => {
                non_empty("resume_text", resume_text)?;
                non_empty("job description", &job.description)
            }
            StageInput::Rescore {
                job,
                markdown,
                markdown_key,
            } => {
                non_empty("job description", &job.description)?;
                non_empty("markdown", markdown)?;
                non_empty("markdown_key", markdown_key)
            }
            StageInput::Convert {
                markdown,
                markdown_key,
                ..
            } => {
                non_empty("markdown", markdown)?;
                non_empty("markdown_key", markdown_key)
            }
        }
    }

    /// Builds the input of `next` from the output of the stage before it.
    pub fn from_predecessor(next: StageKind, output: &StageOutput) -> Result<Self, TaskError> {
        let input = match (next, output) {
            (
                StageKind::Scrape,
                StageOutput::Extracted {
                    resume_text,
                    job: JobSource::Reference(reference),
                },
            ) => StageInput::Scrape {
                resume_text: resume_text.clone(),
                reference: reference.clone(),
            },
            (
                StageKind::Analyze,
                StageOutput::Extracted {
                    resume_text,
                    job: JobSource::Text(text),
                },
            ) => StageInput::Analyze {
                resume_text: resume_text.clone(),
                job: JobRecord::from_text(text),
            },
            (StageKind::Analyze, StageOutput::Scraped { resume_text, job }) => {
                StageInput::Analyze {
                    resume_text: resume_text.clone(),
                    job: job.clone(),
                }
            }
            (
                StageKind::Rescore,
                StageOutput::Generated {
                    job,
                    markdown,
                    markdown_key,
                },
            ) => StageInput::Rescore {
                job: job.clone(),
                markdown: markdown.clone(),
                markdown_key: markdown_key.clone(),
            },
            (
                StageKind::Convert,
                StageOutput::Rescored {
                    markdown,
                    markdown_key,
                    report,
                },
            ) => StageInput::Convert {
                markdown: markdown.clone(),
                markdown_key: markdown_key.clone(),
                report: report.clone(),
            },
            (next, output) => {
                return Err(TaskError::validation(format!(
                    "{next} cannot consume the output of {}",
                    output.produced_by()
                )))
            }
        };
        input.validate()?;
        Ok(input)
    }

    /// Input for the generation segment, built from the reviewed analysis.
    pub fn generate(
        analysis_output: &StageOutput,
        additional_context: Vec<String>,
    ) -> Result<Self, TaskError> {
        let StageOutput::Analyzed {
            resume_text,
            job,
            report,
        } = analysis_output
        else {
            return Err(TaskError::validation(format!(
                "generate cannot consume the output of {}",
                analysis_output.produced_by()
            )));
        };
        let input = StageInput::Generate {
            resume_text: resume_text.clone(),
            job: job.clone(),
            report: report.clone(),
            additional_context,
        };
        input.validate()?;
        Ok(input)
    }
}
