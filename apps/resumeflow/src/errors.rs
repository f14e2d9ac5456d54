use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::pipeline::orchestrator::PipelineError;
use crate::sessions::SessionError;
use crate::store::StoreError;
use crate::tasks::tracker::TrackerError;

/// Machine-readable failure classification recorded on every terminal FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed input shape. Never retried.
    Validation,
    /// Resume text extracted to nothing.
    EmptyResume,
    /// Timeout, rate limit or connection failure talking to a collaborator.
    TransientExternal,
    /// Model output could not be repaired into a mapping.
    UnparseableOutput,
    /// Job reference or object key that does not resolve.
    InvalidReference,
    /// A collaborator rejected the request outright (4xx, bad format).
    ExternalRejected,
    /// Store, serialization or worker panic.
    Internal,
}

impl ErrorKind {
    /// Only transient external failures go back to the broker for another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientExternal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::EmptyResume => "EMPTY_RESUME",
            ErrorKind::TransientExternal => "TRANSIENT_EXTERNAL",
            ErrorKind::UnparseableOutput => "UNPARSEABLE_OUTPUT",
            ErrorKind::InvalidReference => "INVALID_REFERENCE",
            ErrorKind::ExternalRejected => "EXTERNAL_REJECTED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified stage failure. This is the only error shape that leaves a worker.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientExternal, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::internal(format!("store failure: {e}"))
    }
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Empty resume: {0}")]
    EmptyResume(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation.as_str(),
                msg.clone(),
            ),
            AppError::EmptyResume(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::EmptyResume.as_str(),
                msg.clone(),
            ),
            AppError::InvalidReference(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::InvalidReference.as_str(),
                msg.clone(),
            ),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Store(e) => {
                tracing::error!("Store error: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_ERROR",
                    "The task store is unavailable".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Internal.as_str(),
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotFound(_) => AppError::NotFound(e.to_string()),
            PipelineError::EmptyResume => AppError::EmptyResume(e.to_string()),
            PipelineError::InvalidReference(_) => AppError::InvalidReference(e.to_string()),
            PipelineError::Validation(_) => AppError::Validation(e.to_string()),
            PipelineError::NotAtCheckpoint { .. }
            | PipelineError::Halted { .. }
            | PipelineError::Complete(_)
            | PipelineError::Expired(_) => AppError::Conflict(e.to_string()),
            PipelineError::Store(inner) => AppError::Store(inner),
            PipelineError::Artifacts(inner) => AppError::Internal(anyhow::Error::new(inner)),
            PipelineError::Broker(inner) => AppError::Internal(anyhow::Error::new(inner)),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => AppError::NotFound(e.to_string()),
            SessionError::InvalidId | SessionError::InvalidTtl => {
                AppError::Validation(e.to_string())
            }
            SessionError::Store(inner) => AppError::Store(inner),
        }
    }
}

impl From<TrackerError> for AppError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::NotFound(_) => AppError::NotFound(e.to_string()),
            TrackerError::Store(inner) => AppError::Store(inner),
            TrackerError::IllegalTransition { .. } => AppError::Internal(anyhow::Error::new(e)),
        }
    }
}
