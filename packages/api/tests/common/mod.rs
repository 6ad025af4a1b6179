#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{
    JobQueueService, PoolConfig, QueueConfig, StageHandlerRegistry, StageOutput,
    WorkerPoolManager,
};
use api::AdminState;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use db::Database;
use pipeline_core::Stage;
use serde_json::{Value, json};
use tower::ServiceExt;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Echo handlers for every stage.
pub fn echo_handlers() -> StageHandlerRegistry {
    Stage::ALL
        .into_iter()
        .fold(StageHandlerRegistry::new(), |registry, stage| {
            registry.with_fn(stage, move |ctx| async move {
                Ok(StageOutput::new(json!({ "stage": stage.as_str(), "input": ctx.payload })))
            })
        })
}

/// A pool config with one fast-polling upload worker.
pub fn upload_only() -> PoolConfig {
    PoolConfig::empty()
        .with_workers(Stage::Upload, 1)
        .with_lease(Duration::from_secs(30))
        .with_handler_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(20))
        .with_sweep_interval(None)
}

/// Admin state over a fresh in-memory store; the pool is not started.
pub async fn setup_state(pool_config: PoolConfig) -> Result<AdminState, Box<dyn Error>> {
    let db = Database::memory().await?;
    let service = JobQueueService::new(db, QueueConfig::default());
    let pool = Arc::new(WorkerPoolManager::new(service, echo_handlers()));
    Ok(AdminState::new(pool, pool_config))
}

/// Send one request and decode the JSON response body (`Null` if empty).
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Value), Box<dyn Error>> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}
