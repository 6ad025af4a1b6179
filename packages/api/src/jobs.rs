//! Job routes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use db::JobFilter;
use pipeline_core::{
    Job, JobId, JobStatus, LogEntry, LogLevel, NewJob, NewVideoChunk, Priority, QueueItem, Stage,
    VideoChunk,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::state::AdminState;

/// Create the jobs router.
pub fn router() -> Router<AdminState> {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job).delete(delete_job))
        .route("/{id}/cancel", post(cancel_job))
        .route("/{id}/recover", post(recover_job))
        .route("/{id}/enqueue", post(enqueue_stage))
        .route("/{id}/items", get(list_items))
        .route("/{id}/logs", get(list_logs).post(add_log))
        .route("/{id}/chunks", get(list_chunks).post(add_chunks))
}

pub(crate) fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    JobId::parse(raw).map_err(|e| ApiError::bad_request(format!("Invalid job ID: {}", e)))
}

/// Query parameters for listing jobs.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub owner_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

async fn list_jobs(
    State(state): State<AdminState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let filter = JobFilter {
        owner_id: query.owner_id,
        status: query.status,
        limit: Some(query.limit.unwrap_or(50).min(500)),
        offset: query.offset,
    };
    Ok(Json(state.service.list_jobs(&filter).await?))
}

/// Request body for submitting a job.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    #[serde(flatten)]
    pub job: NewJob,
    /// Payload of the first stage item.
    #[serde(default)]
    pub payload: Value,
}

/// A freshly submitted job and its first queue item.
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job: Job,
    pub item: QueueItem,
}

async fn create_job(
    State(state): State<AdminState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let (job, item) = state.service.submit_job(request.job, request.payload).await?;
    Ok((StatusCode::CREATED, Json(CreateJobResponse { job, item })))
}

async fn get_job(State(state): State<AdminState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.service.get_job(job_id).await?))
}

async fn delete_job(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let job_id = parse_job_id(&id)?;
    state.service.delete_job(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelJobRequest {
    pub reason: Option<String>,
}

async fn cancel_job(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Option<Json<CancelJobRequest>>,
) -> ApiResult<Json<Job>> {
    let job_id = parse_job_id(&id)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    Ok(Json(state.service.cancel_job(job_id, request.reason).await?))
}

#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub recovered: usize,
}

async fn recover_job(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RecoverResponse>> {
    let job_id = parse_job_id(&id)?;
    let recovered = state.service.recover_job(job_id).await?;
    Ok(Json(RecoverResponse { recovered }))
}

/// Request body for enqueueing one stage by hand.
#[derive(Debug, Deserialize)]
pub struct EnqueueStageRequest {
    pub stage: Stage,
    #[serde(default)]
    pub payload: Value,
    /// Defaults to the job's priority.
    pub priority: Option<Priority>,
}

async fn enqueue_stage(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(request): Json<EnqueueStageRequest>,
) -> ApiResult<(StatusCode, Json<QueueItem>)> {
    let job_id = parse_job_id(&id)?;
    let priority = match request.priority {
        Some(priority) => priority,
        None => state.service.get_job(job_id).await?.priority,
    };
    let item = state
        .service
        .enqueue_job(job_id, request.stage, request.payload, priority)
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn list_items(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<QueueItem>>> {
    let job_id = parse_job_id(&id)?;
    state.service.get_job(job_id).await?;
    Ok(Json(state.service.get_job_items(job_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

async fn list_logs(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let job_id = parse_job_id(&id)?;
    state.service.get_job(job_id).await?;
    Ok(Json(state.service.get_job_logs(job_id, query.limit).await?))
}

/// Request body for appending a log entry.
#[derive(Debug, Deserialize)]
pub struct AddLogRequest {
    pub level: LogLevel,
    pub message: String,
    pub stage: Option<Stage>,
    #[serde(default)]
    pub metadata: Value,
}

async fn add_log(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(request): Json<AddLogRequest>,
) -> ApiResult<StatusCode> {
    let job_id = parse_job_id(&id)?;
    if request.message.trim().is_empty() {
        return Err(ApiError::validation("log message must not be empty"));
    }

    let mut entry = LogEntry::new(job_id, request.level, request.message, state.service.now())
        .with_metadata(request.metadata);
    if let Some(stage) = request.stage {
        entry = entry.with_stage(stage);
    }

    state.service.add_log(entry).await?;
    Ok(StatusCode::CREATED)
}

async fn list_chunks(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<VideoChunk>>> {
    let job_id = parse_job_id(&id)?;
    state.service.get_job(job_id).await?;
    Ok(Json(state.service.list_video_chunks(job_id).await?))
}

async fn add_chunks(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(chunks): Json<Vec<NewVideoChunk>>,
) -> ApiResult<(StatusCode, Json<Vec<VideoChunk>>)> {
    let job_id = parse_job_id(&id)?;
    let stored = state.service.add_video_chunks(job_id, chunks).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}
