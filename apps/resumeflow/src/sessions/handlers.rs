use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::sessions::SessionBundle;
use crate::state::AppState;

const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Both fields are optional at the wire level so a missing one is a 400, not a
/// deserialization rejection.
#[derive(Deserialize)]
pub struct StoreSessionRequest {
    pub unique_id: Option<String>,
    pub state: Option<SessionBundle>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Serialize)]
pub struct StoreSessionResponse {
    pub unique_id: String,
    pub ttl_seconds: u64,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub unique_id: String,
    pub state: SessionBundle,
}

/// POST /api/v1/sessions
pub async fn handle_store_session(
    State(state): State<AppState>,
    Json(req): Json<StoreSessionRequest>,
) -> Result<(StatusCode, Json<StoreSessionResponse>), AppError> {
    let (Some(unique_id), Some(bundle)) = (req.unique_id, req.state) else {
        return Err(AppError::Validation(
            "unique_id and state are required".to_string(),
        ));
    };
    let ttl_seconds = req.ttl_seconds.unwrap_or(DEFAULT_SESSION_TTL_SECS);
    state
        .sessions
        .store(&unique_id, &bundle, Duration::from_secs(ttl_seconds))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(StoreSessionResponse {
            unique_id,
            ttl_seconds,
        }),
    ))
}

/// GET /api/v1/sessions/:id
pub async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let bundle = state.sessions.retrieve(&id).await?;
    Ok(Json(SessionResponse {
        unique_id: id,
        state: bundle,
    }))
}

/// DELETE /api/v1/sessions/:id
pub async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.sessions.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
