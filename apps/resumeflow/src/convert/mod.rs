//! Document conversion (markdown → docx) through a CloudConvert-style job API:
//! create a job, upload the source to the import form, wait for the job, then
//! download the exported file.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::{ErrorKind, TaskError};

const IMPORT_TASK: &str = "import-markdown";
const CONVERT_TASK: &str = "convert-docx";
const EXPORT_TASK: &str = "export-docx";

pub const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("conversion API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("conversion job {job_id} ended with status '{status}'")]
    JobFailed { job_id: String, status: String },

    #[error("conversion job {job_id} is missing a finished '{task}' task")]
    MissingTask { job_id: String, task: String },

    #[error("conversion did not finish within {0:?}")]
    Timeout(Duration),
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                ErrorKind::TransientExternal
            }
            ConvertError::Http(_) => ErrorKind::ExternalRejected,
            ConvertError::Api { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::TransientExternal
            }
            ConvertError::Api { .. }
            | ConvertError::JobFailed { .. }
            | ConvertError::MissingTask { .. } => ErrorKind::ExternalRejected,
            ConvertError::Timeout(_) => ErrorKind::TransientExternal,
        }
    }
}

impl From<ConvertError> for TaskError {
    fn from(e: ConvertError) -> Self {
        TaskError::new(e.kind(), format!("document conversion failed: {e}"))
    }
}

/// Markdown to binary document. Swappable so tests never touch the network.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// File extension of the produced document.
    fn format(&self) -> &str;

    async fn convert(&self, markdown: &str) -> Result<Bytes, ConvertError>;
}

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    data: Job,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: String,
    status: String,
    #[serde(default)]
    tasks: Vec<JobTask>,
}

#[derive(Debug, Deserialize)]
struct JobTask {
    name: String,
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

impl Job {
    fn task(&self, name: &str) -> Option<&JobTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    fn missing(&self, task: &str) -> ConvertError {
        ConvertError::MissingTask {
            job_id: self.id.clone(),
            task: task.to_string(),
        }
    }

    /// Upload form (url + signed parameters) of the import task.
    fn upload_form(&self) -> Result<(String, HashMap<String, String>), ConvertError> {
        let form = self
            .task(IMPORT_TASK)
            .and_then(|t| t.result.as_ref())
            .and_then(|r| r.get("form"))
            .ok_or_else(|| self.missing(IMPORT_TASK))?;
        let url = form
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| self.missing(IMPORT_TASK))?;
        let parameters = form
            .get("parameters")
            .and_then(Value::as_object)
            .map(|params| {
                params
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok((url.to_string(), parameters))
    }

    fn export_url(&self) -> Result<String, ConvertError> {
        self.task(EXPORT_TASK)
            .filter(|t| t.status == "finished")
            .and_then(|t| t.result.as_ref())
            .and_then(|r| r.get("files"))
            .and_then(|files| files.get(0))
            .and_then(|file| file.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.missing(EXPORT_TASK))
    }
}

fn job_payload() -> Value {
    json!({
        "tasks": {
            IMPORT_TASK: { "operation": "import/upload" },
            CONVERT_TASK: {
                "operation": "convert",
                "input": IMPORT_TASK,
                "input_format": "md",
                "output_format": "docx"
            },
            EXPORT_TASK: { "operation": "export/url", "input": CONVERT_TASK }
        }
    })
}

#[derive(Clone)]
pub struct CloudConvertClient {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl CloudConvertClient {
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Result<Self, ConvertError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            poll_interval: Duration::from_secs(1),
        })
    }

    async fn create_job(&self) -> Result<Job, ConvertError> {
        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&job_payload())
            .send()
            .await?;
        Ok(read_json::<JobEnvelope>(response).await?.data)
    }

    async fn upload(&self, job: &Job, markdown: &str) -> Result<(), ConvertError> {
        let (url, parameters) = job.upload_form()?;
        let mut form = multipart::Form::new();
        for (name, value) in parameters {
            form = form.text(name, value);
        }
        let file = multipart::Part::bytes(markdown.as_bytes().to_vec())
            .file_name("resume.md")
            .mime_str("text/markdown")?;
        form = form.part("file", file);

        let response = self.client.post(url).multipart(form).send().await?;
        check_status(response).await?;
        Ok(())
    }

    /// Polls the job until it leaves the waiting/processing states.
    async fn wait(&self, job_id: &str) -> Result<Job, ConvertError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let response = self
                .client
                .get(format!("{}/jobs/{job_id}", self.base_url))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let job = read_json::<JobEnvelope>(response).await?.data;
            match job.status.as_str() {
                "finished" => return Ok(job),
                "error" => {
                    return Err(ConvertError::JobFailed {
                        job_id: job.id,
                        status: job.status,
                    })
                }
                status => debug!(job_id, status, "conversion job still running"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConvertError::Timeout(self.timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn download(&self, url: &str) -> Result<Bytes, ConvertError> {
        let response = self.client.get(url).send().await?;
        Ok(check_status(response).await?.bytes().await?)
    }
}

#[async_trait]
impl DocumentConverter for CloudConvertClient {
    fn format(&self) -> &str {
        "docx"
    }

    async fn convert(&self, markdown: &str) -> Result<Bytes, ConvertError> {
        let job = self.create_job().await?;
        info!(job_id = %job.id, "conversion job created");

        self.upload(&job, markdown).await?;
        let job = self.wait(&job.id).await?;
        let url = job.export_url()?;
        let document = self.download(&url).await?;

        info!(job_id = %job.id, size_bytes = document.len(), "conversion finished");
        Ok(document)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ConvertError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    warn!("Conversion API returned {}: {}", status, message);
    Err(ConvertError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ConvertError> {
    Ok(check_status(response).await?.json().await?)
}
