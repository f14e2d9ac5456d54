use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::pipeline::orchestrator::{PipelineStarted, PipelineView};
use crate::pipeline::stages::ResumeRef;
use crate::state::AppState;
use crate::tasks::{PipelineId, StatusEnvelope, TaskId};

#[derive(Deserialize)]
pub struct StartPipelineRequest {
    pub resume: ResumeRef,
    /// Posting URL, bare posting id, or the job description text itself.
    pub job_source: String,
}

#[derive(Deserialize, Default)]
pub struct AdvancePipelineRequest {
    #[serde(default)]
    pub additional_context: Vec<String>,
}

#[derive(Serialize)]
pub struct AdvancePipelineResponse {
    pub task_id: TaskId,
}

/// POST /api/v1/pipelines
pub async fn handle_start_pipeline(
    State(state): State<AppState>,
    Json(req): Json<StartPipelineRequest>,
) -> Result<(StatusCode, Json<PipelineStarted>), AppError> {
    let started = state.orchestrator.start(req.resume, &req.job_source).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// GET /api/v1/pipelines/:id
pub async fn handle_get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineView>, AppError> {
    let pipeline_id = parse_pipeline_id(&id)?;
    Ok(Json(state.orchestrator.inspect(&pipeline_id).await?))
}

/// POST /api/v1/pipelines/:id/advance
/// The body is optional; an empty body advances without extra candidate data.
pub async fn handle_advance_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Option<Json<AdvancePipelineRequest>>,
) -> Result<(StatusCode, Json<AdvancePipelineResponse>), AppError> {
    let pipeline_id = parse_pipeline_id(&id)?;
    let Json(req) = req.unwrap_or_default();
    let task_id = state
        .orchestrator
        .advance(&pipeline_id, req.additional_context)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(AdvancePipelineResponse { task_id })))
}

/// GET /api/v1/tasks/:id/status
pub async fn handle_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusEnvelope>, AppError> {
    let task_id: TaskId = id
        .parse()
        .map_err(|_| AppError::NotFound(format!("task '{id}' not found")))?;
    Ok(Json(state.tracker.get_status(&task_id).await?))
}

fn parse_pipeline_id(raw: &str) -> Result<PipelineId, AppError> {
    raw.parse()
        .map_err(|_| AppError::NotFound(format!("pipeline '{raw}' not found")))
}
