//! Queue-wide routes: statistics, recovery, cleanup and single items.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use pipeline_core::{ItemId, QueueItem, QueueStats};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AdminState;

/// Create the queue router.
pub fn router() -> Router<AdminState> {
    Router::new()
        .route("/stats", get(queue_stats))
        .route("/recover", post(recover_stuck))
        .route("/cleanup", post(cleanup))
        .route("/items/{id}", get(get_item))
        .route("/items/{id}/release", post(release_item))
}

fn parse_item_id(raw: &str) -> ApiResult<ItemId> {
    ItemId::parse(raw).map_err(|e| ApiError::bad_request(format!("Invalid item ID: {}", e)))
}

async fn queue_stats(State(state): State<AdminState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.service.get_queue_stats().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecoverRequest {
    /// Defaults to the pool's configured threshold.
    pub stuck_minutes: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub recovered: usize,
}

async fn recover_stuck(
    State(state): State<AdminState>,
    body: Option<Json<RecoverRequest>>,
) -> ApiResult<Json<RecoverResponse>> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let stuck_minutes = request.stuck_minutes.unwrap_or_else(|| {
        state
            .pool
            .config()
            .unwrap_or_else(|| state.pool_config.clone())
            .stuck_minutes
    });
    let recovered = state.service.recover_stuck_jobs(stuck_minutes).await?;
    Ok(Json(RecoverResponse { recovered }))
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    /// Terminal jobs untouched for longer than this are deleted.
    pub older_than_hours: u64,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: usize,
}

async fn cleanup(
    State(state): State<AdminState>,
    Json(request): Json<CleanupRequest>,
) -> ApiResult<Json<CleanupResponse>> {
    let older_than = Duration::from_secs(request.older_than_hours.saturating_mul(3600));
    let deleted = state.service.cleanup_old_jobs(older_than).await?;
    Ok(Json(CleanupResponse { deleted }))
}

async fn get_item(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<Json<QueueItem>> {
    let item_id = parse_item_id(&id)?;
    Ok(Json(state.service.get_item(item_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReleaseRequest {
    /// Seconds before the item may be claimed again.
    pub delay_secs: u64,
}

async fn release_item(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Option<Json<ReleaseRequest>>,
) -> ApiResult<Json<QueueItem>> {
    let item_id = parse_item_id(&id)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let item = state
        .service
        .release_job_claim(item_id, Duration::from_secs(request.delay_secs))
        .await?;
    Ok(Json(item))
}
