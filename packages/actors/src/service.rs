//! Job queue service: the only writer of jobs and queue items.
//!
//! Workers, the sweeper and the admin API all go through this type. Every
//! queue item transition is a conditional update in the store, so any number
//! of service clones (in one process or several) can share a database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::{
    ChunkRepository, Database, DbError, FailOutcome, JobFilter, JobRepository, LogRepository,
    QueueItemRepository,
};
use pipeline_core::{
    Clock, ItemId, Job, JobEvent, JobId, JobStatus, LogEntry, NewJob, NewVideoChunk, Priority,
    QueueItem, QueueStats, Stage, SystemClock, VideoChunk,
};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::config::QueueConfig;
use crate::error::QueueError;

/// Candidates fetched per claim round.
const CLAIM_BATCH: usize = 8;
/// Retries of an optimistic write that lost a race.
const CONFLICT_RETRIES: usize = 3;

/// Handle to the job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueueService {
    jobs: JobRepository,
    items: QueueItemRepository,
    logs: LogRepository,
    chunks: ChunkRepository,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    event_tx: broadcast::Sender<JobEvent>,
}

impl std::fmt::Debug for JobQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueueService")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Longest span added to a timestamp; keeps date arithmetic in range.
const MAX_SPAN: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_SPAN)).unwrap_or(chrono::Duration::zero())
}

impl JobQueueService {
    /// Create a service over `db` using the system clock.
    pub fn new(db: Database, config: QueueConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            jobs: JobRepository::new(db.clone()),
            items: QueueItemRepository::new(db.clone()),
            logs: LogRepository::new(db.clone()),
            chunks: ChunkRepository::new(db),
            clock: Arc::new(SystemClock),
            config,
            event_tx,
        }
    }

    /// Replace the clock used for every timestamp and lease computation.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current time according to the service clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Subscribe to job and worker events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        tracing::trace!("{}", event.description());
        let _ = self.event_tx.send(event);
    }

    async fn log(&self, entry: LogEntry) {
        if let Err(e) = self.logs.append(&entry).await {
            tracing::warn!(job_id = %entry.job_id, "Failed to append job log: {}", e);
        }
    }

    async fn require_job(&self, job_id: JobId) -> Result<Job, QueueError> {
        self.jobs
            .find(job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))
    }

    async fn require_item(&self, item_id: ItemId) -> Result<QueueItem, QueueError> {
        self.items
            .find(item_id)
            .await?
            .ok_or(QueueError::ItemNotFound(item_id))
    }

    // ---- jobs -----------------------------------------------------------

    /// Insert a pending job.
    pub async fn create_job(&self, input: NewJob) -> Result<Job, QueueError> {
        if input.title.trim().is_empty() {
            return Err(QueueError::validation("job title must not be empty"));
        }

        let now = self.now();
        let job = self.jobs.create(&Job::new(input, now)).await?;

        tracing::info!(job_id = %job.id, priority = %job.priority, "Job created: {}", job.title);
        self.log(LogEntry::info(job.id, "Job created", now)).await;
        self.emit(JobEvent::JobCreated {
            job: job.clone(),
            timestamp: now,
        });

        Ok(job)
    }

    /// Create a job and enqueue its first stage with `payload`.
    pub async fn submit_job(
        &self,
        input: NewJob,
        payload: Value,
    ) -> Result<(Job, QueueItem), QueueError> {
        let job = self.create_job(input).await?;
        let item = self
            .enqueue_job(job.id, Stage::first(), payload, job.priority)
            .await?;
        let job = self.require_job(job.id).await?;
        Ok((job, item))
    }

    /// Insert a waiting item for `(job_id, stage)`.
    ///
    /// The job must exist and not be terminal, and the pair must not already
    /// have a waiting or claimed item.
    pub async fn enqueue_job(
        &self,
        job_id: JobId,
        stage: Stage,
        payload: Value,
        priority: Priority,
    ) -> Result<QueueItem, QueueError> {
        let job = self
            .jobs
            .find(job_id)
            .await?
            .ok_or_else(|| QueueError::validation(format!("job {} does not exist", job_id)))?;

        if job.status.is_terminal() {
            return Err(QueueError::validation(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        let now = self.now();
        let item = QueueItem::new(job_id, stage, payload, priority, now);

        let item = match self.items.enqueue(&item).await {
            Ok(item) => item,
            Err(DbError::AlreadyExists(_)) => {
                return Err(QueueError::ActiveItemExists { job_id, stage });
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(%job_id, item_id = %item.id, %stage, "Enqueued stage item");
        self.log(LogEntry::info(job_id, format!("Enqueued for {}", stage), now).with_stage(stage))
            .await;
        self.emit(JobEvent::ItemEnqueued {
            item: item.clone(),
            timestamp: now,
        });

        Ok(item)
    }

    /// Claim the next waiting item of `stage` for `worker_id`.
    ///
    /// Items are taken by priority, then age. Losing a race to another worker
    /// moves on to the next candidate, and a batch lost entirely is followed
    /// by a fresh read. `None` means no claimable item was left.
    pub async fn claim_next_item(
        &self,
        stage: Stage,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<QueueItem>, QueueError> {
        let now = self.now();
        let expires_at = now + to_chrono(lease);

        loop {
            let candidates = self.items.claim_candidates(stage, now, CLAIM_BATCH).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                let claimed = match self
                    .items
                    .try_claim(candidate.id, worker_id, now, expires_at)
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(e) if e.is_conflict() => None,
                    Err(e) => return Err(e.into()),
                };

                let Some(item) = claimed else {
                    tracing::debug!(item_id = %candidate.id, worker_id, "Claim conflict");
                    continue;
                };

                if let Err(e) = self.jobs.mark_processing(item.job_id, now).await {
                    tracing::warn!(job_id = %item.job_id, "Failed to mark job processing: {}", e);
                }

                tracing::debug!(
                    item_id = %item.id,
                    job_id = %item.job_id,
                    %stage,
                    worker_id,
                    "Claimed item"
                );
                self.log(
                    LogEntry::info(item.job_id, format!("Claimed by {}", worker_id), now)
                        .with_stage(stage)
                        .with_metadata(json!({ "attempt": item.attempts + 1 })),
                )
                .await;
                self.emit(JobEvent::ItemClaimed {
                    item_id: item.id,
                    job_id: item.job_id,
                    stage,
                    worker_id: worker_id.to_string(),
                    timestamp: now,
                });

                return Ok(Some(item));
            }
        }
    }

    /// Check that `worker_id` still holds the claim on `item`.
    fn ensure_holder(item: &QueueItem, worker_id: &str) -> Result<(), QueueError> {
        if !item.status.is_active() {
            return Err(QueueError::ItemNotActive(item.id));
        }
        if item.worker_id.as_deref() != Some(worker_id) {
            return Err(QueueError::ClaimLost {
                item_id: item.id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Mark an item done and record its result on the job.
    ///
    /// Only the worker holding the claim may complete the item; a claim that
    /// was recovered and handed to someone else yields
    /// [`QueueError::ClaimLost`]. On the terminal stage the job becomes
    /// completed at 100%.
    pub async fn complete_item(
        &self,
        item_id: ItemId,
        worker_id: &str,
        result: Value,
    ) -> Result<Job, QueueError> {
        let item = self.require_item(item_id).await?;
        Self::ensure_holder(&item, worker_id)?;

        let now = self.now();
        self.items
            .complete(item_id, Some(worker_id), now)
            .await?
            .ok_or_else(|| QueueError::ClaimLost {
                item_id,
                worker_id: worker_id.to_string(),
            })?;

        let stage = item.stage;
        let mut job = self.record_result(item.job_id, stage, result, now).await?;

        self.log(LogEntry::info(item.job_id, format!("{} completed", stage), now).with_stage(stage))
            .await;
        self.emit(JobEvent::ItemCompleted {
            item_id,
            job_id: item.job_id,
            stage,
            progress: job.progress_percentage,
            timestamp: now,
        });

        if stage.is_terminal() {
            if let Some(completed) = self.jobs.mark_completed(item.job_id, now).await? {
                job = completed;
                tracing::info!(job_id = %job.id, "Job completed");
                self.log(LogEntry::info(job.id, "Job completed", now)).await;
                self.emit(JobEvent::JobCompleted {
                    job_id: job.id,
                    timestamp: now,
                });
            }
        }

        Ok(job)
    }

    /// Store a stage result, retrying writes that lost a race.
    async fn record_result(
        &self,
        job_id: JobId,
        stage: Stage,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let progress = stage.progress_after();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .jobs
                .record_stage_result(job_id, stage, result.clone(), progress, now)
                .await
            {
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    tracing::debug!(%job_id, %stage, "Retrying stage result write: {}", e);
                }
                other => return Ok(other?),
            }
        }
    }

    /// Record a failed attempt of an item by the worker holding its claim.
    ///
    /// The attempt counter lives in the store; `attempt` is the caller's view
    /// and only used for diagnostics. Below the attempt budget the item goes
    /// back to waiting after an exponential back-off; otherwise the item and
    /// its job are marked failed. A report from a worker that no longer
    /// holds the claim yields [`QueueError::ClaimLost`] and changes nothing.
    pub async fn fail_item(
        &self,
        item_id: ItemId,
        worker_id: &str,
        error: &str,
        attempt: u32,
    ) -> Result<FailOutcome, QueueError> {
        let max_attempts = self.config.max_attempts;
        let mut last_conflict = None;

        for _ in 0..CONFLICT_RETRIES {
            let item = self.require_item(item_id).await?;
            Self::ensure_holder(&item, worker_id)?;
            if attempt != item.attempts + 1 {
                tracing::debug!(
                    %item_id,
                    attempt,
                    stored = item.attempts,
                    "Attempt number differs from store"
                );
            }

            let now = self.now();
            let retry_at = now + to_chrono(self.config.retry_delay(item.attempts + 1));

            let outcome = match self
                .items
                .fail(
                    item_id,
                    Some(worker_id),
                    item.attempts,
                    max_attempts,
                    error,
                    retry_at,
                    now,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(e) if e.is_conflict() => {
                    last_conflict = Some(e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let failed = outcome.item();
            let (job_id, stage) = (failed.job_id, failed.stage);

            self.emit(JobEvent::ItemFailed {
                item_id,
                job_id,
                stage,
                error: error.to_string(),
                attempts: failed.attempts,
                will_retry: outcome.will_retry(),
                timestamp: now,
            });

            match &outcome {
                FailOutcome::Retrying(item) => {
                    tracing::warn!(
                        %job_id,
                        %item_id,
                        %stage,
                        attempts = item.attempts,
                        "Stage failed, will retry: {}",
                        error
                    );
                    self.log(
                        LogEntry::warn(
                            job_id,
                            format!(
                                "{} failed (attempt {}/{}), retrying: {}",
                                stage, item.attempts, max_attempts, error
                            ),
                            now,
                        )
                        .with_stage(stage),
                    )
                    .await;
                }
                FailOutcome::Exhausted(item) => {
                    tracing::error!(
                        %job_id,
                        %item_id,
                        %stage,
                        attempts = item.attempts,
                        "Stage failed permanently: {}",
                        error
                    );
                    self.jobs.mark_failed(job_id, error, now).await?;
                    self.log(
                        LogEntry::error(
                            job_id,
                            format!("{} failed after {} attempts: {}", stage, item.attempts, error),
                            now,
                        )
                        .with_stage(stage),
                    )
                    .await;
                    self.emit(JobEvent::JobFailed {
                        job_id,
                        stage,
                        error: error.to_string(),
                        timestamp: now,
                    });
                }
            }

            return Ok(outcome);
        }

        Err(last_conflict
            .unwrap_or_else(|| DbError::Conflict(format!("Queue item {} kept changing", item_id)))
            .into())
    }

    /// Release a claim without counting an attempt.
    ///
    /// The item becomes claimable again once `delay` has passed.
    pub async fn release_job_claim(
        &self,
        item_id: ItemId,
        delay: Duration,
    ) -> Result<QueueItem, QueueError> {
        let item = self.require_item(item_id).await?;
        let now = self.now();

        let released = self
            .items
            .release(item_id, None, now + to_chrono(delay), now)
            .await?
            .ok_or(QueueError::NotClaimed(item_id))?;

        tracing::info!(job_id = %item.job_id, %item_id, stage = %item.stage, "Released claim");
        self.log(
            LogEntry::info(
                item.job_id,
                format!("Claim released, claimable again in {:?}", delay),
                now,
            )
            .with_stage(item.stage)
            .with_metadata(json!({ "previous_worker": item.worker_id })),
        )
        .await;
        self.emit(JobEvent::ItemReleased {
            item_id,
            job_id: item.job_id,
            stage: item.stage,
            previous_worker: item.worker_id,
            timestamp: now,
        });

        Ok(released)
    }

    /// Release every claim whose lease expired or that is older than
    /// `stuck_minutes`, appending a warning per item. Returns the count.
    pub async fn recover_stuck_jobs(&self, stuck_minutes: u64) -> Result<usize, QueueError> {
        let now = self.now();
        let stuck_after = to_chrono(Duration::from_secs(stuck_minutes.saturating_mul(60)));

        let claimed = self.items.list_claimed(None).await?;
        let mut recovered = 0;

        for item in claimed.into_iter().filter(|item| item.is_stuck(now, stuck_after)) {
            if self.release_stuck(&item, now, "Recovered stuck item").await? {
                recovered += 1;
            }
        }

        if recovered > 0 {
            tracing::warn!(recovered, stuck_minutes, "Recovered stuck queue items");
        }

        Ok(recovered)
    }

    /// Release every claimed item of one job. Returns the count.
    pub async fn recover_job(&self, job_id: JobId) -> Result<usize, QueueError> {
        self.require_job(job_id).await?;
        let now = self.now();

        let mut recovered = 0;
        for item in self.items.list_claimed(Some(job_id)).await? {
            if self.release_stuck(&item, now, "Manually recovered item").await? {
                recovered += 1;
            }
        }

        tracing::info!(%job_id, recovered, "Manual job recovery");
        Ok(recovered)
    }

    async fn release_stuck(
        &self,
        item: &QueueItem,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, QueueError> {
        // Only release while the worker we saw still holds the item.
        let released = self
            .items
            .release(item.id, item.worker_id.as_deref(), now, now)
            .await?;

        if released.is_none() {
            return Ok(false);
        }

        let worker = item.worker_id.as_deref().unwrap_or("unknown");
        tracing::warn!(
            job_id = %item.job_id,
            item_id = %item.id,
            stage = %item.stage,
            worker_id = worker,
            "{}",
            reason
        );
        self.log(
            LogEntry::warn(
                item.job_id,
                format!("{} from worker {}", reason, worker),
                now,
            )
            .with_stage(item.stage)
            .with_metadata(json!({
                "item_id": item.id,
                "worker_id": item.worker_id,
                "claimed_at": item.claimed_at,
                "claim_expires_at": item.claim_expires_at,
            })),
        )
        .await;
        self.emit(JobEvent::ItemReleased {
            item_id: item.id,
            job_id: item.job_id,
            stage: item.stage,
            previous_worker: item.worker_id.clone(),
            timestamp: now,
        });

        Ok(true)
    }

    /// Cancel a non-terminal job, failing its waiting and claimed items.
    pub async fn cancel_job(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<Job, QueueError> {
        let job = self.require_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(QueueError::validation(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        let now = self.now();
        let reason = reason.unwrap_or_else(|| "cancelled".to_string());
        let failed = self.items.fail_active_for_job(job_id, &reason, now).await?;
        let job = self
            .jobs
            .mark_cancelled(job_id, now)
            .await?
            .ok_or_else(|| QueueError::validation(format!("job {} finished meanwhile", job_id)))?;

        tracing::info!(%job_id, items = failed.len(), "Job cancelled: {}", reason);
        self.log(LogEntry::warn(job_id, format!("Job cancelled: {}", reason), now))
            .await;
        self.emit(JobEvent::JobCancelled {
            job_id,
            timestamp: now,
        });

        Ok(job)
    }

    /// Delete a job with its items, logs and chunks.
    pub async fn delete_job(&self, job_id: JobId) -> Result<(), QueueError> {
        match self.jobs.delete(job_id).await {
            Ok(()) => {
                tracing::info!(%job_id, "Job deleted");
                Ok(())
            }
            Err(DbError::NotFound(_)) => Err(QueueError::JobNotFound(job_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete terminal jobs not updated within `older_than`. Returns the count.
    pub async fn cleanup_old_jobs(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = self.now() - to_chrono(older_than);
        let expired = self.jobs.finished_before(cutoff).await?;

        let mut deleted = 0;
        for job_id in expired {
            match self.jobs.delete(job_id).await {
                Ok(()) => deleted += 1,
                Err(DbError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if deleted > 0 {
            tracing::info!(deleted, "Cleaned up old jobs");
        }
        Ok(deleted)
    }

    // ---- bookkeeping ----------------------------------------------------

    pub async fn add_log(&self, entry: LogEntry) -> Result<(), QueueError> {
        self.require_job(entry.job_id).await?;
        self.logs.append(&entry).await?;
        Ok(())
    }

    /// Store chunk descriptions for a job.
    pub async fn add_video_chunks(
        &self,
        job_id: JobId,
        chunks: Vec<NewVideoChunk>,
    ) -> Result<Vec<VideoChunk>, QueueError> {
        self.require_job(job_id).await?;

        if let Some(bad) = chunks
            .iter()
            .find(|c| !(c.start_time >= 0.0 && c.end_time >= c.start_time))
        {
            return Err(QueueError::validation(format!(
                "chunk {} has an invalid time range {}..{}",
                bad.chunk_index, bad.start_time, bad.end_time
            )));
        }

        let stored = match self.chunks.insert_many(job_id, chunks, self.now()).await {
            Ok(stored) => stored,
            Err(DbError::AlreadyExists(_)) => {
                return Err(QueueError::validation("chunk index already stored for job"));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(%job_id, count = stored.len(), "Stored video chunks");
        Ok(stored)
    }

    pub async fn list_video_chunks(&self, job_id: JobId) -> Result<Vec<VideoChunk>, QueueError> {
        Ok(self.chunks.list_for_job(job_id).await?)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, QueueError> {
        self.require_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.jobs.list(filter).await?)
    }

    /// Jobs of one owner, newest first.
    pub async fn get_user_jobs(
        &self,
        owner_id: &str,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, QueueError> {
        let filter = JobFilter {
            owner_id: Some(owner_id.to_string()),
            status,
            limit,
            offset: None,
        };
        Ok(self.jobs.list(&filter).await?)
    }

    pub async fn get_job_items(&self, job_id: JobId) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.items.list_for_job(job_id).await?)
    }

    pub async fn get_job_logs(
        &self,
        job_id: JobId,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, QueueError> {
        Ok(self.logs.list_for_job(job_id, limit).await?)
    }

    pub async fn get_item(&self, item_id: ItemId) -> Result<QueueItem, QueueError> {
        self.require_item(item_id).await
    }

    /// Per-stage item counts and the job status distribution.
    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for (stage, status, count) in self.items.count_by_stage().await? {
            stats.record_items(stage, status, count);
        }
        for (status, count) in self.jobs.count_by_status().await? {
            stats.record_jobs(status, count);
        }
        Ok(stats)
    }
}
