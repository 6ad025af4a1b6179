//! Queue item types for per-stage work units.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::{JobId, JobStatus, ParseError, Priority, Stage};

/// Unique identifier for a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Ulid);

impl ItemId {
    /// Create a new unique item ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse an item ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a queue item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Waiting,
    Claimed,
    Done,
    Failed,
}

impl ItemStatus {
    /// Waiting and claimed items occupy the active slot of their `(job, stage)`.
    pub fn is_active(&self) -> bool {
        matches!(self, ItemStatus::Waiting | ItemStatus::Claimed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Waiting => "waiting",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(ItemStatus::Waiting),
            "claimed" => Ok(ItemStatus::Claimed),
            "done" => Ok(ItemStatus::Done),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(ParseError::new("item status", other)),
        }
    }
}

/// A unit of work for one job at one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub job_id: JobId,
    pub stage: Stage,
    /// Opaque input for the stage handler.
    pub payload: Value,
    pub priority: Priority,
    pub status: ItemStatus,
    /// Worker holding the claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Lease deadline while claimed; cool-down deadline after a release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Earliest instant the item may be claimed.
    pub available_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a new waiting item.
    pub fn new(
        job_id: JobId,
        stage: Stage,
        payload: Value,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ItemId::new(),
            job_id,
            stage,
            payload,
            priority,
            status: ItemStatus::Waiting,
            worker_id: None,
            claimed_at: None,
            claim_expires_at: None,
            available_at: now,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A worker holds an unexpired lease on this item.
    pub fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.worker_id.is_some() && self.claim_expires_at.is_some_and(|expires| expires > now)
    }

    /// The item has a worker attached whose lease expired, or whose claim is
    /// older than `stuck_after`.
    pub fn is_stuck(&self, now: DateTime<Utc>, stuck_after: Duration) -> bool {
        if self.worker_id.is_none() {
            return false;
        }
        let lease_expired = self.claim_expires_at.is_none_or(|expires| expires < now);
        let claim_too_old = self
            .claimed_at
            .is_some_and(|claimed| claimed < now - stuck_after);
        lease_expired || claim_too_old
    }
}

/// Item counts for a single stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCounts {
    pub waiting: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
}

impl StageCounts {
    /// Items still occupying the stage (waiting + claimed).
    pub fn active(&self) -> u64 {
        self.waiting + self.claimed
    }

    pub(crate) fn add(&mut self, status: ItemStatus, count: u64) {
        match status {
            ItemStatus::Waiting => self.waiting += count,
            ItemStatus::Claimed => self.claimed += count,
            ItemStatus::Done => self.done += count,
            ItemStatus::Failed => self.failed += count,
        }
    }
}

/// Aggregate view of the queue table and the job status distribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Item counts per stage.
    pub stages: BTreeMap<Stage, StageCounts>,
    /// Number of jobs per status.
    pub jobs: BTreeMap<JobStatus, u64>,
}

impl QueueStats {
    /// Record `count` items of `stage` in `status`.
    pub fn record_items(&mut self, stage: Stage, status: ItemStatus, count: u64) {
        self.stages.entry(stage).or_default().add(status, count);
    }

    /// Record `count` jobs in `status`.
    pub fn record_jobs(&mut self, status: JobStatus, count: u64) {
        *self.jobs.entry(status).or_default() += count;
    }

    /// Counts for one stage, zero if it has never seen an item.
    pub fn stage(&self, stage: Stage) -> StageCounts {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    /// Number of jobs in one status.
    pub fn jobs_in(&self, status: JobStatus) -> u64 {
        self.jobs.get(&status).copied().unwrap_or(0)
    }

    pub fn total_jobs(&self) -> u64 {
        self.jobs.values().sum()
    }

    /// Items waiting or claimed across all stages.
    pub fn active_items(&self) -> u64 {
        self.stages.values().map(StageCounts::active).sum()
    }
}
