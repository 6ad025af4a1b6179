//! Worker pool routes.

use actors::{RemoveMode, SystemHealth, WorkerStatus};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use pipeline_core::Stage;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AdminState;

/// Create the workers router.
pub fn worker_router() -> Router<AdminState> {
    Router::new()
        .route("/", get(list_workers).post(add_worker))
        .route("/{id}", get(get_worker).delete(remove_worker))
        .route("/{id}/restart", post(restart_worker))
}

/// Create the pool router.
pub fn pool_router() -> Router<AdminState> {
    Router::new()
        .route("/health", get(pool_health))
        .route("/start", post(start_pool))
        .route("/stop", post(stop_pool))
        .route("/restart", post(restart_pool))
}

async fn pool_health(State(state): State<AdminState>) -> Json<SystemHealth> {
    Json(state.pool.get_system_health())
}

async fn start_pool(State(state): State<AdminState>) -> ApiResult<Json<SystemHealth>> {
    let config = state
        .pool
        .config()
        .unwrap_or_else(|| state.pool_config.clone());
    state.pool.start(config).await?;
    Ok(Json(state.pool.get_system_health()))
}

async fn stop_pool(State(state): State<AdminState>) -> ApiResult<Json<SystemHealth>> {
    state.pool.stop().await?;
    Ok(Json(state.pool.get_system_health()))
}

async fn restart_pool(State(state): State<AdminState>) -> ApiResult<Json<SystemHealth>> {
    state.pool.restart().await?;
    Ok(Json(state.pool.get_system_health()))
}

async fn list_workers(State(state): State<AdminState>) -> Json<Vec<WorkerStatus>> {
    Json(state.pool.get_worker_statuses())
}

#[derive(Debug, Deserialize)]
pub struct AddWorkerRequest {
    pub stage: Stage,
}

#[derive(Debug, Serialize)]
pub struct AddWorkerResponse {
    pub worker_id: String,
}

async fn add_worker(
    State(state): State<AdminState>,
    Json(request): Json<AddWorkerRequest>,
) -> ApiResult<(StatusCode, Json<AddWorkerResponse>)> {
    let worker_id = state.pool.add_worker(request.stage).await?;
    Ok((StatusCode::CREATED, Json(AddWorkerResponse { worker_id })))
}

async fn get_worker(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkerStatus>> {
    state
        .pool
        .get_worker_details(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Worker not found: {}", id)))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveWorkerQuery {
    /// Stop without waiting for the in-flight item.
    #[serde(default)]
    pub abandon: bool,
}

async fn remove_worker(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveWorkerQuery>,
) -> ApiResult<StatusCode> {
    let mode = if query.abandon {
        RemoveMode::Abandon
    } else {
        RemoveMode::Graceful
    };
    state.pool.remove_worker(&id, mode).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_worker(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkerStatus>> {
    state.pool.restart_worker(&id).await?;
    state
        .pool
        .get_worker_details(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Worker not found: {}", id)))
}
