//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ItemId, Job, JobId, QueueItem, Stage};

/// Events emitted by the queue and the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A new job was created.
    JobCreated { job: Job, timestamp: DateTime<Utc> },
    /// A stage item was enqueued for a job.
    ItemEnqueued {
        item: QueueItem,
        timestamp: DateTime<Utc>,
    },
    /// A worker claimed a stage item.
    ItemClaimed {
        item_id: ItemId,
        job_id: JobId,
        stage: Stage,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A stage item completed.
    ItemCompleted {
        item_id: ItemId,
        job_id: JobId,
        stage: Stage,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    /// A stage item failed.
    ItemFailed {
        item_id: ItemId,
        job_id: JobId,
        stage: Stage,
        error: String,
        attempts: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A claim was released, by an operator or by the stuck-item sweep.
    ItemReleased {
        item_id: ItemId,
        job_id: JobId,
        stage: Stage,
        previous_worker: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// The terminal stage completed.
    JobCompleted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A stage exhausted its attempts.
    JobFailed {
        job_id: JobId,
        stage: Stage,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A job was cancelled.
    JobCancelled {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker started polling its stage.
    WorkerStarted {
        worker_id: String,
        stage: Stage,
        timestamp: DateTime<Utc>,
    },
    /// A worker stopped.
    WorkerStopped {
        worker_id: String,
        stage: Stage,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobCreated { timestamp, .. } => *timestamp,
            JobEvent::ItemEnqueued { timestamp, .. } => *timestamp,
            JobEvent::ItemClaimed { timestamp, .. } => *timestamp,
            JobEvent::ItemCompleted { timestamp, .. } => *timestamp,
            JobEvent::ItemFailed { timestamp, .. } => *timestamp,
            JobEvent::ItemReleased { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::JobCancelled { timestamp, .. } => *timestamp,
            JobEvent::WorkerStarted { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobCreated { job, .. } => Some(job.id),
            JobEvent::ItemEnqueued { item, .. } => Some(item.job_id),
            JobEvent::ItemClaimed { job_id, .. } => Some(*job_id),
            JobEvent::ItemCompleted { job_id, .. } => Some(*job_id),
            JobEvent::ItemFailed { job_id, .. } => Some(*job_id),
            JobEvent::ItemReleased { job_id, .. } => Some(*job_id),
            JobEvent::JobCompleted { job_id, .. } => Some(*job_id),
            JobEvent::JobFailed { job_id, .. } => Some(*job_id),
            JobEvent::JobCancelled { job_id, .. } => Some(*job_id),
            JobEvent::WorkerStarted { .. } | JobEvent::WorkerStopped { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobCreated { job, .. } => format!("Job {} created", job.id),
            JobEvent::ItemEnqueued { item, .. } => {
                format!("Job {} enqueued for {}", item.job_id, item.stage)
            }
            JobEvent::ItemClaimed {
                job_id,
                stage,
                worker_id,
                ..
            } => format!("Job {} {} claimed by {}", job_id, stage, worker_id),
            JobEvent::ItemCompleted {
                job_id,
                stage,
                progress,
                ..
            } => format!("Job {} {} completed ({}%)", job_id, stage, progress),
            JobEvent::ItemFailed {
                job_id,
                stage,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} {} failed: {}{}", job_id, stage, error, retry)
            }
            JobEvent::ItemReleased { job_id, stage, .. } => {
                format!("Job {} {} released", job_id, stage)
            }
            JobEvent::JobCompleted { job_id, .. } => format!("Job {} completed", job_id),
            JobEvent::JobFailed { job_id, stage, .. } => {
                format!("Job {} failed at {}", job_id, stage)
            }
            JobEvent::JobCancelled { job_id, .. } => format!("Job {} cancelled", job_id),
            JobEvent::WorkerStarted {
                worker_id, stage, ..
            } => format!("Worker {} started on {}", worker_id, stage),
            JobEvent::WorkerStopped {
                worker_id, stage, ..
            } => format!("Worker {} stopped on {}", worker_id, stage),
        }
    }
}
