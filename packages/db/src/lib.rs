//! SurrealDB integration for the video pipeline queue.
//!
//! This crate provides database connectivity and repositories for
//! persisting jobs, stage queue items, job logs and video chunks.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError};
pub use repositories::{
    ChunkRepository, FailOutcome, JobFilter, JobRepository, LogRepository, QueueItemRepository,
};
pub use schema::init_schema;

/// Connect with the given configuration and apply the schema.
///
/// This should be called once at application startup.
pub async fn init(config: DbConfig) -> Result<Database, DbError> {
    Database::init(config).await
}
