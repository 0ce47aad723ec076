//! Deployment API endpoints
//!
//! POST  /api/deployments                 - Submit a deployment
//! GET   /api/deployments                 - List recent deployments
//! GET   /api/deployments/:id             - Get a deployment record
//! PATCH /api/deployments/:id             - Update deployment status
//! GET   /api/deployments/:id/logs        - Paged persisted events
//! GET   /api/deployments/:id/stream      - Live event stream (SSE)
//! GET   /health                          - Liveness

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::EventPage;
use crate::domain::{DeployRequest, Job, JobResult, JobStatus, JobUpdate};

use super::auth::RequireAuth;
use super::error::ApiError;
use super::stream::stream_events;
use super::AppState;

/// Upper bound for `limit` query parameters
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default = "default_jobs_limit")]
    pub limit: usize,
}

fn default_jobs_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_logs_limit")]
    pub limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_logs_limit() -> usize {
    100
}

/// Body of a status update
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl StatusPatch {
    fn into_update(self) -> Result<JobUpdate, ApiError> {
        match self.status {
            JobStatus::Pending => Err(ApiError::bad_request(
                "status must be one of: running, succeeded, failed",
            )),
            JobStatus::Running => Ok(JobUpdate::status(JobStatus::Running)),
            JobStatus::Succeeded => self
                .result
                .map(JobUpdate::succeeded)
                .ok_or_else(|| ApiError::bad_request("result is required when marking a deployment succeeded")),
            JobStatus::Failed => Ok(JobUpdate::failed(
                self.failure_reason
                    .unwrap_or_else(|| "Marked failed via API".to_string()),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

/// Submit a deployment; returns as soon as ids are allocated
pub async fn submit_deployment(
    _auth: RequireAuth,
    State(state): State<AppState>,
    body: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    let submission = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn list_deployments(
    _auth: RequireAuth,
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state
        .orchestrator
        .store()
        .list_jobs(query.limit.clamp(1, MAX_PAGE_LIMIT))
        .await?;
    Ok(Json(jobs))
}

/// Look up by internal or external id
pub(crate) async fn find_job(state: &AppState, id: &str) -> Result<Job, ApiError> {
    state
        .orchestrator
        .store()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Deployment not found: {}", id)))
}

pub async fn get_deployment(
    _auth: RequireAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(find_job(&state, &id).await?))
}

pub async fn update_deployment(
    _auth: RequireAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<StatusPatch>, JsonRejection>,
) -> Result<Json<Job>, ApiError> {
    let update = json_body(body)?.into_update()?;
    let job = find_job(&state, &id).await?;
    let updated = state.orchestrator.store().update_status(&job.id, update).await?;
    tracing::info!(job_id = %updated.id, status = %updated.status, "Deployment status updated via API");
    Ok(Json(updated))
}

pub async fn get_deployment_logs(
    _auth: RequireAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let job = find_job(&state, &id).await?;
    let page = state
        .orchestrator
        .store()
        .list_events(&job.id, query.page.max(1), query.limit.clamp(1, MAX_PAGE_LIMIT))
        .await?;
    Ok(Json(page))
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Deployment API routes
pub fn deployment_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/deployments", post(submit_deployment).get(list_deployments))
        .route(
            "/api/deployments/:id",
            get(get_deployment).patch(update_deployment),
        )
        .route("/api/deployments/:id/logs", get(get_deployment_logs))
        .route("/api/deployments/:id/stream", get(stream_events))
}
