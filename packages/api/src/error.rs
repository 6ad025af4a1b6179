//! API error handling.

use actors::{ConfigError, PoolError, QueueError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::DbError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: &'static str,
    pub message: String,
}

/// API error type that converts into a JSON response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(msg) => ApiError::validation(msg),
            QueueError::JobNotFound(_) | QueueError::ItemNotFound(_) => {
                ApiError::not_found(err.to_string())
            }
            QueueError::ActiveItemExists { .. }
            | QueueError::ItemNotActive(_)
            | QueueError::NotClaimed(_)
            | QueueError::ClaimLost { .. } => ApiError::conflict(err.to_string()),
            QueueError::Store(DbError::Conflict(msg)) => ApiError::conflict(msg),
            QueueError::Store(e) => {
                tracing::error!("Store error: {}", e);
                ApiError::internal("Database error occurred")
            }
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::AlreadyRunning | PoolError::NotRunning => {
                ApiError::conflict(err.to_string())
            }
            PoolError::WorkerNotFound(_) => ApiError::not_found(err.to_string()),
            PoolError::MissingHandler(_) | PoolError::Config(_) => {
                ApiError::bad_request(err.to_string())
            }
            PoolError::Spawn(msg) => {
                tracing::error!("Worker spawn failed: {}", msg);
                ApiError::internal("Failed to spawn worker")
            }
        }
    }
}

/// Errors while wiring the pipeline at startup.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}
