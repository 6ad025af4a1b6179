//! Job repository for CRUD operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pipeline_core::{Job, JobId, JobStatus, Priority, Stage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{from_millis, parse_id, to_millis};
use crate::{Database, DbError};

/// Repository for job persistence operations.
#[derive(Debug, Clone)]
pub struct JobRepository {
    db: Database,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    job_id: String,
    title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner_id: Option<String>,
    status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_stage: Option<Stage>,
    #[serde(default)]
    progress_percentage: u8,
    priority: Priority,
    #[serde(default)]
    processing_options: Value,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    result_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<i64>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            title: job.title.clone(),
            description: job.description.clone(),
            owner_id: job.owner_id.clone(),
            status: job.status,
            current_stage: job.current_stage,
            progress_percentage: job.progress_percentage,
            priority: job.priority,
            processing_options: job.processing_options.clone(),
            metadata: job.metadata.clone(),
            result_data: job.result_data.clone(),
            last_error: job.last_error.clone(),
            created_at: to_millis(job.created_at),
            updated_at: to_millis(job.updated_at),
            completed_at: job.completed_at.map(to_millis),
        }
    }
}

impl JobRecord {
    fn into_job(self) -> Result<Job, DbError> {
        Ok(Job {
            id: parse_id("job", &self.job_id, JobId::parse)?,
            title: self.title,
            description: self.description,
            owner_id: self.owner_id,
            status: self.status,
            current_stage: self.current_stage,
            progress_percentage: self.progress_percentage,
            priority: self.priority,
            processing_options: self.processing_options,
            metadata: self.metadata,
            result_data: self.result_data,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            completed_at: self.completed_at.map(from_millis).transpose()?,
        })
    }
}

fn into_jobs(records: Vec<JobRecord>) -> Result<Vec<Job>, DbError> {
    records.into_iter().map(JobRecord::into_job).collect()
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub owner_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

const TERMINAL: &str = "['completed', 'failed', 'cancelled']";

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new job in the database.
    pub async fn create(&self, job: &Job) -> Result<Job, DbError> {
        let record: Option<JobRecord> = self
            .db
            .client()
            .create(("job", job.id.to_string()))
            .content(JobRecord::from(job))
            .await?;

        record
            .map(JobRecord::into_job)
            .transpose()?
            .ok_or_else(|| DbError::Query("Failed to create job".into()))
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Get a job by ID, `None` if it does not exist.
    pub async fn find(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRecord> = self.db.client().select(("job", id.to_string())).await?;
        record.map(JobRecord::into_job).transpose()
    }

    /// List jobs with optional filtering, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, DbError> {
        let mut conditions = Vec::new();
        let mut bindings: Vec<(&str, Value)> = Vec::new();

        if let Some(owner_id) = &filter.owner_id {
            conditions.push("owner_id = $owner_id");
            bindings.push(("owner_id", Value::from(owner_id.clone())));
        }

        if let Some(status) = filter.status {
            conditions.push("status = $status");
            bindings.push(("status", Value::from(status.as_str())));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let offset_clause = filter
            .offset
            .map(|o| format!("START {}", o))
            .unwrap_or_default();

        let query = format!(
            "SELECT * FROM job {} ORDER BY created_at DESC {} {}",
            where_clause, limit_clause, offset_clause
        );

        let mut result = self.db.client().query(&query);

        for (name, value) in bindings {
            result = result.bind((name, value));
        }

        let mut response = result.await?;
        let records: Vec<JobRecord> = response.take(0)?;

        into_jobs(records)
    }

    /// Move a pending or queued job to `processing`.
    ///
    /// Returns `None` when the job is already past that point.
    pub async fn mark_processing(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DbError> {
        self.update_one(
            id,
            r#"
            UPDATE type::thing('job', $id)
            SET status = 'processing', updated_at = $now
            WHERE status IN ['pending', 'queued']
            RETURN AFTER
            "#,
            now,
            Vec::new(),
        )
        .await
    }

    /// Store a stage output under `result_data[stage]` and raise the progress.
    ///
    /// One statement touches only this stage's key, so stages of the same job
    /// completing at once keep each other's results. Progress never moves
    /// backwards.
    pub async fn record_stage_result(
        &self,
        id: JobId,
        stage: Stage,
        result: Value,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<Job, DbError> {
        // Stage names are fixed snake_case identifiers, safe as a field path.
        let query = format!(
            r#"
            UPDATE type::thing('job', $id)
            SET result_data.{stage} = $result,
                progress_percentage = math::max([progress_percentage ?? 0, $progress]),
                updated_at = $now
            RETURN AFTER
            "#,
            stage = stage.as_str()
        );

        self.update_one(
            id,
            &query,
            now,
            vec![
                ("result", result),
                ("progress", Value::from(progress.min(100))),
            ],
        )
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Mark a job completed at 100% progress.
    pub async fn mark_completed(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DbError> {
        let query = format!(
            r#"
            UPDATE type::thing('job', $id)
            SET status = 'completed', progress_percentage = 100, completed_at = $now,
                last_error = NONE, updated_at = $now
            WHERE status NOT IN {TERMINAL}
            RETURN AFTER
            "#
        );
        self.update_one(id, &query, now, Vec::new()).await
    }

    /// Mark a job failed with the error that exhausted its attempts.
    pub async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DbError> {
        let query = format!(
            r#"
            UPDATE type::thing('job', $id)
            SET status = 'failed', last_error = $error, updated_at = $now
            WHERE status NOT IN {TERMINAL}
            RETURN AFTER
            "#
        );
        self.update_one(id, &query, now, vec![("error", Value::from(error))])
            .await
    }

    /// Mark a non-terminal job cancelled.
    pub async fn mark_cancelled(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DbError> {
        let query = format!(
            r#"
            UPDATE type::thing('job', $id)
            SET status = 'cancelled', updated_at = $now
            WHERE status NOT IN {TERMINAL}
            RETURN AFTER
            "#
        );
        self.update_one(id, &query, now, Vec::new()).await
    }

    /// Delete a job together with its queue items, slots, logs and chunks.
    pub async fn delete(&self, id: JobId) -> Result<(), DbError> {
        if self.find(id).await?.is_none() {
            return Err(DbError::NotFound(format!("Job not found: {}", id)));
        }

        self.db
            .client()
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE queue_item WHERE job_id = $job_id;
                DELETE queue_slot WHERE job_id = $job_id;
                DELETE job_log WHERE job_id = $job_id;
                DELETE video_chunk WHERE job_id = $job_id;
                DELETE type::thing('job', $job_id);
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("job_id", id.to_string()))
            .await?
            .check()?;

        Ok(())
    }

    /// Terminal jobs whose last update is older than `cutoff`.
    pub async fn finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, DbError> {
        let query = format!(
            "SELECT job_id, created_at FROM job WHERE status IN {TERMINAL} AND updated_at < $cutoff ORDER BY created_at ASC"
        );
        let mut result = self
            .db
            .client()
            .query(query)
            .bind(("cutoff", to_millis(cutoff)))
            .await?;

        #[derive(Deserialize)]
        struct JobRef {
            job_id: String,
        }

        let refs: Vec<JobRef> = result.take(0)?;
        refs.into_iter()
            .map(|r| parse_id("job", &r.job_id, JobId::parse))
            .collect()
    }

    /// Count jobs by status.
    pub async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, DbError> {
        let mut result = self
            .db
            .client()
            .query("SELECT status, count() AS count FROM job GROUP BY status")
            .await?;

        #[derive(Deserialize)]
        struct StatusCount {
            status: Option<JobStatus>,
            count: i64,
        }

        let counts: Vec<StatusCount> = result.take(0)?;

        let mut map = HashMap::new();
        for count in counts {
            if let Some(status) = count.status {
                map.insert(status, count.count.max(0) as u64);
            }
        }

        Ok(map)
    }

    async fn update_one(
        &self,
        id: JobId,
        query: &str,
        now: DateTime<Utc>,
        bindings: Vec<(&'static str, Value)>,
    ) -> Result<Option<Job>, DbError> {
        let mut request = self
            .db
            .client()
            .query(query)
            .bind(("id", id.to_string()))
            .bind(("now", to_millis(now)));

        for binding in bindings {
            request = request.bind(binding);
        }

        let mut response = request.await?;
        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().next().map(JobRecord::into_job).transpose()
    }
}
