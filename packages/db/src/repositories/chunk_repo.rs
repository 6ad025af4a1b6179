//! Video chunk repository.

use chrono::{DateTime, Utc};
use pipeline_core::{JobId, NewVideoChunk, VideoChunk};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use super::{from_millis, parse_id, to_millis};
use crate::{Database, DbError};

#[derive(Debug, Clone)]
pub struct ChunkRepository {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkRecord {
    chunk_id: String,
    job_id: String,
    chunk_index: u32,
    start_time: f64,
    end_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    storage_path: Option<String>,
    #[serde(default)]
    metadata: Value,
    created_at: i64,
}

impl ChunkRecord {
    fn into_chunk(self) -> Result<VideoChunk, DbError> {
        Ok(VideoChunk {
            id: parse_id("chunk", &self.chunk_id, Ulid::from_string)?,
            job_id: parse_id("job", &self.job_id, JobId::parse)?,
            chunk_index: self.chunk_index,
            start_time: self.start_time,
            end_time: self.end_time,
            storage_path: self.storage_path,
            metadata: self.metadata,
            created_at: from_millis(self.created_at)?,
        })
    }
}

impl ChunkRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store the chunks of a job in a single insert.
    ///
    /// A chunk index that already exists for the job rejects the whole batch.
    pub async fn insert_many(
        &self,
        job_id: JobId,
        chunks: Vec<NewVideoChunk>,
        now: DateTime<Utc>,
    ) -> Result<Vec<VideoChunk>, DbError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let chunks: Vec<VideoChunk> = chunks
            .into_iter()
            .map(|chunk| VideoChunk::new(job_id, chunk, now))
            .collect();

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .map(|chunk| ChunkRecord {
                chunk_id: chunk.id.to_string(),
                job_id: chunk.job_id.to_string(),
                chunk_index: chunk.chunk_index,
                start_time: chunk.start_time,
                end_time: chunk.end_time,
                storage_path: chunk.storage_path.clone(),
                metadata: chunk.metadata.clone(),
                created_at: to_millis(chunk.created_at),
            })
            .collect();

        self.db
            .client()
            .query("INSERT INTO video_chunk $chunks")
            .bind(("chunks", records))
            .await?
            .check()?;

        Ok(chunks)
    }

    /// Chunks of a job ordered by index.
    pub async fn list_for_job(&self, job_id: JobId) -> Result<Vec<VideoChunk>, DbError> {
        let mut result = self
            .db
            .client()
            .query("SELECT * FROM video_chunk WHERE job_id = $job_id ORDER BY chunk_index ASC")
            .bind(("job_id", job_id.to_string()))
            .await?;

        let records: Vec<ChunkRecord> = result.take(0)?;
        records.into_iter().map(ChunkRecord::into_chunk).collect()
    }
}
