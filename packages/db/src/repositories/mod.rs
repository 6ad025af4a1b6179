//! Repository implementations for database operations.

mod chunk_repo;
mod job_repo;
mod log_repo;
mod queue_item_repo;

pub use chunk_repo::ChunkRepository;
pub use job_repo::{JobFilter, JobRepository};
pub use log_repo::LogRepository;
pub use queue_item_repo::{FailOutcome, QueueItemRepository};

use chrono::{DateTime, Utc};

use crate::DbError;

/// Timestamps are persisted as epoch milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DbError::Serialization(format!("timestamp out of range: {}", millis)))
}

pub(crate) fn parse_id<T>(
    kind: &str,
    raw: &str,
    parse: impl FnOnce(&str) -> Result<T, ulid::DecodeError>,
) -> Result<T, DbError> {
    parse(raw).map_err(|e| DbError::Serialization(format!("invalid {} id {}: {}", kind, raw, e)))
}
