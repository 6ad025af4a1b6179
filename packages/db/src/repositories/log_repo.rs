//! Append-only job log.

use pipeline_core::{JobId, LogEntry, LogLevel, Stage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{from_millis, parse_id, to_millis};
use crate::{Database, DbError};

#[derive(Debug, Clone)]
pub struct LogRepository {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    job_id: String,
    level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    message: String,
    #[serde(default)]
    metadata: Value,
    timestamp: i64,
}

impl LogRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one entry.
    pub async fn append(&self, entry: &LogEntry) -> Result<(), DbError> {
        let record = LogRecord {
            job_id: entry.job_id.to_string(),
            level: entry.level,
            stage: entry.stage,
            message: entry.message.clone(),
            metadata: entry.metadata.clone(),
            timestamp: to_millis(entry.timestamp),
        };

        self.db
            .client()
            .query("CREATE job_log CONTENT $record")
            .bind(("record", record))
            .await?
            .check()?;

        Ok(())
    }

    /// Entries of a job in the order they were written.
    pub async fn list_for_job(
        &self,
        job_id: JobId,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, DbError> {
        let limit_clause = limit.map(|l| format!("LIMIT {}", l)).unwrap_or_default();
        let query = format!(
            "SELECT * FROM job_log WHERE job_id = $job_id ORDER BY timestamp ASC {}",
            limit_clause
        );

        let mut result = self
            .db
            .client()
            .query(query)
            .bind(("job_id", job_id.to_string()))
            .await?;

        let records: Vec<LogRecord> = result.take(0)?;

        records
            .into_iter()
            .map(|r| {
                Ok(LogEntry {
                    job_id: parse_id("job", &r.job_id, JobId::parse)?,
                    level: r.level,
                    stage: r.stage,
                    message: r.message,
                    metadata: r.metadata,
                    timestamp: from_millis(r.timestamp)?,
                })
            })
            .collect()
    }
}
