//! Database schema definitions using SurrealQL.
//!
//! Tables are schemaless so opaque JSON payloads round-trip untouched;
//! timestamps are stored as epoch milliseconds.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    for schema in [
        JOB_SCHEMA,
        QUEUE_ITEM_SCHEMA,
        QUEUE_SLOT_SCHEMA,
        JOB_LOG_SCHEMA,
        VIDEO_CHUNK_SCHEMA,
    ] {
        db.client().query(schema).await?.check()?;
    }

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_owner ON job FIELDS owner_id;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
"#;

/// Queue item table schema.
const QUEUE_ITEM_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue_item SCHEMALESS;

DEFINE INDEX IF NOT EXISTS item_job ON queue_item FIELDS job_id;
DEFINE INDEX IF NOT EXISTS item_worker ON queue_item FIELDS worker_id;

-- Compound index for stage polling (waiting items by priority, then age)
DEFINE INDEX IF NOT EXISTS item_dispatch ON queue_item FIELDS stage, status, priority_rank, created_at;
"#;

/// Active slot table: one record per `(job, stage)` while that pair has a
/// waiting or claimed item. Record ids are deterministic, so a second
/// CREATE for the same pair fails.
const QUEUE_SLOT_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue_slot SCHEMALESS;

DEFINE INDEX IF NOT EXISTS slot_item ON queue_slot FIELDS item_id UNIQUE;
DEFINE INDEX IF NOT EXISTS slot_job ON queue_slot FIELDS job_id;
"#;

/// Append-only job log.
const JOB_LOG_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_log SCHEMALESS;

DEFINE INDEX IF NOT EXISTS log_job ON job_log FIELDS job_id, timestamp;
"#;

/// Video chunks produced while splitting.
const VIDEO_CHUNK_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS video_chunk SCHEMALESS;

DEFINE INDEX IF NOT EXISTS chunk_job_index ON video_chunk FIELDS job_id, chunk_index UNIQUE;
"#;
