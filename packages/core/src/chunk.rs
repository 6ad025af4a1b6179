//! Video chunk bookkeeping produced by the splitting stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::JobId;

/// A chunk description supplied by a stage handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVideoChunk {
    pub chunk_index: u32,
    /// Offset into the source video, in seconds.
    pub start_time: f64,
    pub end_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl NewVideoChunk {
    pub fn new(chunk_index: u32, start_time: f64, end_time: f64) -> Self {
        Self {
            chunk_index,
            start_time,
            end_time,
            storage_path: None,
            metadata: Value::Null,
        }
    }

    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A persisted video chunk belonging to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoChunk {
    pub id: Ulid,
    pub job_id: JobId,
    pub chunk_index: u32,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl VideoChunk {
    pub fn new(job_id: JobId, chunk: NewVideoChunk, now: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            job_id,
            chunk_index: chunk.chunk_index,
            start_time: chunk.start_time,
            end_time: chunk.end_time,
            storage_path: chunk.storage_path,
            metadata: chunk.metadata,
            created_at: now,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}
