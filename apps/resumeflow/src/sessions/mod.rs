//! Session State Store: opaque CRUD over externally issued authentication bundles.
//!
//! The payload (cookie set plus a local-storage snapshot) is stored as-is. Only the
//! identifier and TTL are checked.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::store::{get_json, keys, set_json, KvStore, StoreError};

pub mod handlers;

/// Longest lifetime a caller may request for a stored session.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Opaque session payload. Any JSON value round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionBundle(pub Value);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session id must be non-empty and free of whitespace")]
    InvalidId,

    #[error("session TTL must be between 1 second and 30 days")]
    InvalidTtl,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Overwrites any previous bundle under `id` and restarts its TTL.
    pub async fn store(
        &self,
        id: &str,
        bundle: &SessionBundle,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        validate_id(id)?;
        if ttl.is_zero() || ttl > MAX_SESSION_TTL {
            return Err(SessionError::InvalidTtl);
        }
        set_json(self.store.as_ref(), &keys::session(id), bundle, ttl).await?;
        info!(session_id = %id, ttl_secs = ttl.as_secs(), "session stored");
        Ok(())
    }

    pub async fn retrieve(&self, id: &str) -> Result<SessionBundle, SessionError> {
        validate_id(id)?;
        get_json(self.store.as_ref(), &keys::session(id))
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        validate_id(id)?;
        if self.store.delete(&keys::session(id)).await? {
            info!(session_id = %id, "session deleted");
            Ok(())
        } else {
            Err(SessionError::NotFound(id.to_string()))
        }
    }
}

fn validate_id(id: &str) -> Result<(), SessionError> {
    if id.is_empty() || id.contains(char::is_whitespace) {
        return Err(SessionError::InvalidId);
    }
    Ok(())
}
