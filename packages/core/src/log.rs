//! Append-only job log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobId, Stage};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A diagnostic line in a job's stage-by-stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            level,
            stage: None,
            message: message.into(),
            metadata: Value::Null,
            timestamp,
        }
    }

    pub fn info(job_id: JobId, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, LogLevel::Info, message, timestamp)
    }

    pub fn warn(job_id: JobId, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, LogLevel::Warn, message, timestamp)
    }

    pub fn error(job_id: JobId, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, LogLevel::Error, message, timestamp)
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
