//! Error types for the queue service and the worker pool.

use db::DbError;
use pipeline_core::{ItemId, JobId, Stage};
use thiserror::Error;

/// Errors returned by [`crate::JobQueueService`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Queue item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Job {job_id} already has an active {stage} item")]
    ActiveItemExists { job_id: JobId, stage: Stage },

    #[error("Queue item {0} is not waiting or claimed")]
    ItemNotActive(ItemId),

    #[error("Queue item {0} is not claimed")]
    NotClaimed(ItemId),

    #[error("Queue item {item_id} is no longer claimed by {worker_id}")]
    ClaimLost { item_id: ItemId, worker_id: String },

    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl QueueError {
    pub fn validation(message: impl Into<String>) -> Self {
        QueueError::Validation(message.into())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned by [`crate::WorkerPoolManager`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("No handler registered for stage {0}")]
    MissingHandler(Stage),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Failed to spawn actor: {0}")]
    Spawn(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ractor::SpawnErr> for PoolError {
    fn from(err: ractor::SpawnErr) -> Self {
        PoolError::Spawn(err.to_string())
    }
}
