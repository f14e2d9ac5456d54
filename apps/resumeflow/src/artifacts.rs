//! Artifact storage: uploaded resumes, generated markdown and converted documents.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;

use crate::errors::{ErrorKind, TaskError};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact '{0}' does not exist")]
    NotFound(String),

    #[error("artifact store unavailable: {0}")]
    Unavailable(String),
}

impl From<ArtifactError> for TaskError {
    fn from(e: ArtifactError) -> Self {
        let kind = match e {
            ArtifactError::NotFound(_) => ErrorKind::InvalidReference,
            ArtifactError::Unavailable(_) => ErrorKind::TransientExternal,
        };
        TaskError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Overwrites `key`; writing the same bytes twice is harmless.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), ArtifactError>;

    async fn get(&self, key: &str) -> Result<Artifact, ArtifactError>;
}

#[derive(Clone)]
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), ArtifactError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ArtifactError::Unavailable(format!("S3 upload failed: {e}")))?;

        info!("Uploaded {size} bytes to s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Artifact, ArtifactError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    ArtifactError::NotFound(key.to_string())
                } else {
                    ArtifactError::Unavailable(format!("S3 download failed: {e}"))
                }
            })?;

        let content_type = output.content_type().map(str::to_string);
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ArtifactError::Unavailable(format!("S3 body read failed: {e}")))?;
        Ok(Artifact {
            bytes: data.into_bytes(),
            content_type,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemoryArtifacts {
        objects: Mutex<HashMap<String, Artifact>>,
    }

    impl MemoryArtifacts {
        pub(crate) fn with_object(self, key: &str, bytes: &[u8], content_type: &str) -> Self {
            self.objects.lock().unwrap().insert(
                key.to_string(),
                Artifact {
                    bytes: Bytes::copy_from_slice(bytes),
                    content_type: Some(content_type.to_string()),
                },
            );
            self
        }

        pub(crate) fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    #[async_trait]
    impl ArtifactStore for MemoryArtifacts {
        async fn put(
            &self,
            key: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> Result<(), ArtifactError> {
            self.objects.lock().unwrap().insert(
                key.to_string(),
                Artifact {
                    bytes,
                    content_type: Some(content_type.to_string()),
                },
            );
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Artifact, ArtifactError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| ArtifactError::NotFound(key.to_string()))
        }
    }

    #[test]
    fn test_missing_artifact_is_an_invalid_reference() {
        let err: TaskError = ArtifactError::NotFound("resumes/x.pdf".into()).into();
        assert_eq!(err.kind, ErrorKind::InvalidReference);
        let err: TaskError = ArtifactError::Unavailable("reset".into()).into();
        assert!(err.is_retryable());
    }
}
