//! Administrative HTTP surface for the video pipeline.
//!
//! This crate exposes the queue service and the worker pool over axum:
//! - Job management (submit, list, cancel, delete, recover, logs, chunks)
//! - Queue statistics, stuck-item recovery and cleanup
//! - Worker pool control (start, stop, scale, restart, health)
//! - Real-time events (SSE streaming)

mod error;
mod init;
mod jobs;
mod queues;
mod realtime;
mod state;
mod workers;

use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

pub use error::{ApiError, ApiErrorResponse, ApiResult, InitError};
pub use init::init_pipeline;
pub use jobs::{CreateJobRequest, CreateJobResponse};
pub use realtime::sse_event;
pub use state::AdminState;

/// Create the admin router with all routes.
pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .nest("/api/jobs", jobs::router())
        .nest("/api/queue", queues::router())
        .nest("/api/workers", workers::worker_router())
        .nest("/api/pool", workers::pool_router())
        .nest("/api/events", realtime::router())
        .with_state(state)
}

/// Liveness check with pool status.
async fn liveness(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "pool_running": state.pool.is_running(),
    }))
}
