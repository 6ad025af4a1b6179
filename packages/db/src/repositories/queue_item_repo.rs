//! Queue item repository: enqueue, atomic claim and item state transitions.
//!
//! Every transition is a single conditional `UPDATE ... WHERE` on one record,
//! so two callers racing on the same item can never both succeed. Enqueue
//! writes a `queue_slot` record keyed by `(job, stage)` in the same
//! transaction as the item; the slot's deterministic id makes a second active
//! item for the pair impossible.

use chrono::{DateTime, Utc};
use pipeline_core::{ItemId, ItemStatus, JobId, Priority, QueueItem, Stage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{from_millis, parse_id, to_millis};
use crate::{Database, DbError};

/// Repository for stage queue items.
#[derive(Debug, Clone)]
pub struct QueueItemRepository {
    db: Database,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct QueueItemRecord {
    item_id: String,
    job_id: String,
    stage: Stage,
    #[serde(default)]
    payload: Value,
    priority: Priority,
    priority_rank: u8,
    status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claimed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claim_expires_at: Option<i64>,
    available_at: i64,
    #[serde(default)]
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<&QueueItem> for QueueItemRecord {
    fn from(item: &QueueItem) -> Self {
        Self {
            item_id: item.id.to_string(),
            job_id: item.job_id.to_string(),
            stage: item.stage,
            payload: item.payload.clone(),
            priority: item.priority,
            priority_rank: item.priority.rank(),
            status: item.status,
            worker_id: item.worker_id.clone(),
            claimed_at: item.claimed_at.map(to_millis),
            claim_expires_at: item.claim_expires_at.map(to_millis),
            available_at: to_millis(item.available_at),
            attempts: item.attempts,
            last_error: item.last_error.clone(),
            created_at: to_millis(item.created_at),
            updated_at: to_millis(item.updated_at),
        }
    }
}

impl QueueItemRecord {
    fn into_item(self) -> Result<QueueItem, DbError> {
        Ok(QueueItem {
            id: parse_id("item", &self.item_id, ItemId::parse)?,
            job_id: parse_id("job", &self.job_id, JobId::parse)?,
            stage: self.stage,
            payload: self.payload,
            priority: self.priority,
            status: self.status,
            worker_id: self.worker_id,
            claimed_at: self.claimed_at.map(from_millis).transpose()?,
            claim_expires_at: self.claim_expires_at.map(from_millis).transpose()?,
            available_at: from_millis(self.available_at)?,
            attempts: self.attempts,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

/// Active slot held by the waiting or claimed item of a `(job, stage)`.
#[derive(Debug, Serialize, Deserialize)]
struct SlotRecord {
    job_id: String,
    stage: Stage,
    item_id: String,
    created_at: i64,
}

/// What happened to an item after a failure was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Back to `waiting`, claimable again at `available_at`.
    Retrying(QueueItem),
    /// Attempts exhausted; the item is `failed` and its slot is released.
    Exhausted(QueueItem),
}

impl FailOutcome {
    pub fn item(&self) -> &QueueItem {
        match self {
            FailOutcome::Retrying(item) | FailOutcome::Exhausted(item) => item,
        }
    }

    pub fn will_retry(&self) -> bool {
        matches!(self, FailOutcome::Retrying(_))
    }
}

fn slot_id(job_id: JobId, stage: Stage) -> String {
    format!("{}_{}", job_id, stage)
}

fn first_item(records: Vec<QueueItemRecord>) -> Result<Option<QueueItem>, DbError> {
    records
        .into_iter()
        .next()
        .map(QueueItemRecord::into_item)
        .transpose()
}

fn into_items(records: Vec<QueueItemRecord>) -> Result<Vec<QueueItem>, DbError> {
    records.into_iter().map(QueueItemRecord::into_item).collect()
}

const ACTIVE: &str = "['waiting', 'claimed']";

/// `WHERE` clause for resolving an item, optionally pinned to its claim holder.
fn holder_guard(expected_worker: Option<&str>) -> String {
    match expected_worker {
        Some(_) => "status = 'claimed' AND worker_id = $expected_worker".to_string(),
        None => format!("status IN {ACTIVE}"),
    }
}

impl QueueItemRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a waiting item and point its job at the item's stage.
    ///
    /// The slot record, the item and the job update commit together. Fails
    /// with [`DbError::AlreadyExists`] when the `(job, stage)` pair already
    /// has a waiting or claimed item.
    pub async fn enqueue(&self, item: &QueueItem) -> Result<QueueItem, DbError> {
        match self.try_enqueue(item).await {
            Err(DbError::AlreadyExists(message)) => {
                // A slot can outlive its item if a process died between the
                // item's final update and the slot delete.
                if self.clear_stale_slot(item.job_id, item.stage).await? {
                    self.try_enqueue(item).await
                } else {
                    Err(DbError::AlreadyExists(message))
                }
            }
            other => other,
        }
    }

    async fn try_enqueue(&self, item: &QueueItem) -> Result<QueueItem, DbError> {
        let slot = SlotRecord {
            job_id: item.job_id.to_string(),
            stage: item.stage,
            item_id: item.id.to_string(),
            created_at: to_millis(item.created_at),
        };

        let mut response = self
            .db
            .client()
            .query(
                r#"
                BEGIN TRANSACTION;
                CREATE type::thing('queue_slot', $slot_id) CONTENT $slot;
                CREATE type::thing('queue_item', $item_id) CONTENT $item;
                UPDATE type::thing('job', $job_id) SET current_stage = $stage, updated_at = $now;
                UPDATE type::thing('job', $job_id) SET status = 'queued' WHERE status != 'processing';
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("slot_id", slot_id(item.job_id, item.stage)))
            .bind(("slot", slot))
            .bind(("item_id", item.id.to_string()))
            .bind(("item", QueueItemRecord::from(item)))
            .bind(("job_id", item.job_id.to_string()))
            .bind(("stage", item.stage))
            .bind(("now", to_millis(item.created_at)))
            .await?;

        let errors = response.take_errors();
        if !errors.is_empty() {
            let mut errors: Vec<DbError> = errors.into_values().map(DbError::from).collect();
            let position = errors
                .iter()
                .position(|e| matches!(e, DbError::AlreadyExists(_)))
                .unwrap_or(0);
            return Err(errors.swap_remove(position));
        }

        self.get(item.id).await
    }

    /// Remove the slot of `(job, stage)` if the item it points at is gone or
    /// no longer active. Returns whether a slot was removed.
    async fn clear_stale_slot(&self, job_id: JobId, stage: Stage) -> Result<bool, DbError> {
        let slot: Option<SlotRecord> = self
            .db
            .client()
            .select(("queue_slot", slot_id(job_id, stage)))
            .await?;

        let Some(slot) = slot else {
            return Ok(false);
        };

        let item_id = parse_id("item", &slot.item_id, ItemId::parse)?;
        let stale = match self.find(item_id).await? {
            Some(item) => !item.status.is_active(),
            None => true,
        };

        if stale {
            tracing::warn!(%job_id, %stage, %item_id, "Clearing stale queue slot");
            self.release_slot(job_id, stage, item_id).await?;
        }

        Ok(stale)
    }

    /// Drop the `(job, stage)` slot, but only while `item_id` owns it.
    async fn release_slot(
        &self,
        job_id: JobId,
        stage: Stage,
        item_id: ItemId,
    ) -> Result<(), DbError> {
        self.db
            .client()
            .query("DELETE type::thing('queue_slot', $slot_id) WHERE item_id = $item_id")
            .bind(("slot_id", slot_id(job_id, stage)))
            .bind(("item_id", item_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Get an item by ID.
    pub async fn get(&self, id: ItemId) -> Result<QueueItem, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Queue item not found: {}", id)))
    }

    /// Get an item by ID, `None` if it does not exist.
    pub async fn find(&self, id: ItemId) -> Result<Option<QueueItem>, DbError> {
        let record: Option<QueueItemRecord> = self
            .db
            .client()
            .select(("queue_item", id.to_string()))
            .await?;
        record.map(QueueItemRecord::into_item).transpose()
    }

    /// All items of a job, oldest first.
    pub async fn list_for_job(&self, job_id: JobId) -> Result<Vec<QueueItem>, DbError> {
        let mut result = self
            .db
            .client()
            .query("SELECT * FROM queue_item WHERE job_id = $job_id ORDER BY created_at ASC")
            .bind(("job_id", job_id.to_string()))
            .await?;

        let records: Vec<QueueItemRecord> = result.take(0)?;
        into_items(records)
    }

    /// The waiting or claimed item of `(job, stage)`, if any.
    pub async fn find_active(
        &self,
        job_id: JobId,
        stage: Stage,
    ) -> Result<Option<QueueItem>, DbError> {
        let query = format!(
            "SELECT * FROM queue_item WHERE job_id = $job_id AND stage = $stage AND status IN {ACTIVE} LIMIT 1"
        );
        let mut result = self
            .db
            .client()
            .query(query)
            .bind(("job_id", job_id.to_string()))
            .bind(("stage", stage))
            .await?;

        let records: Vec<QueueItemRecord> = result.take(0)?;
        first_item(records)
    }

    /// Claimable items of a stage in dispatch order: priority, then age.
    pub async fn claim_candidates(
        &self,
        stage: Stage,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, DbError> {
        let mut result = self
            .db
            .client()
            .query(
                r#"
                SELECT * FROM queue_item
                WHERE stage = $stage AND status = 'waiting' AND worker_id = NONE
                    AND available_at <= $now
                ORDER BY priority_rank DESC, created_at ASC
                LIMIT $limit
                "#,
            )
            .bind(("stage", stage))
            .bind(("now", to_millis(now)))
            .bind(("limit", limit as i64))
            .await?;

        let records: Vec<QueueItemRecord> = result.take(0)?;
        into_items(records)
    }

    /// Claim one item for `worker_id` until `expires_at`.
    ///
    /// Returns `None` when another worker got there first.
    pub async fn try_claim(
        &self,
        id: ItemId,
        worker_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, DbError> {
        let mut result = self
            .db
            .client()
            .query(
                r#"
                UPDATE type::thing('queue_item', $item_id)
                SET status = 'claimed', worker_id = $worker_id, claimed_at = $now,
                    claim_expires_at = $expires_at, updated_at = $now
                WHERE status = 'waiting' AND worker_id = NONE AND available_at <= $now
                RETURN AFTER
                "#,
            )
            .bind(("item_id", id.to_string()))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("now", to_millis(now)))
            .bind(("expires_at", to_millis(expires_at)))
            .await?;

        let records: Vec<QueueItemRecord> = result.take(0)?;
        first_item(records)
    }

    /// Mark an active item done and free its slot.
    ///
    /// With `expected_worker` the item must still be claimed by that worker.
    /// Returns `None` when the guard does not hold.
    pub async fn complete(
        &self,
        id: ItemId,
        expected_worker: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, DbError> {
        let guard = holder_guard(expected_worker);
        let query = format!(
            r#"
            UPDATE type::thing('queue_item', $item_id)
            SET status = 'done', worker_id = NONE, claim_expires_at = NONE, updated_at = $now
            WHERE {guard}
            RETURN AFTER
            "#
        );
        let mut request = self
            .db
            .client()
            .query(query)
            .bind(("item_id", id.to_string()))
            .bind(("now", to_millis(now)));
        if let Some(worker) = expected_worker {
            request = request.bind(("expected_worker", worker.to_string()));
        }

        let mut result = request.await?;
        let records: Vec<QueueItemRecord> = result.take(0)?;
        let item = first_item(records)?;
        if let Some(item) = &item {
            self.release_slot(item.job_id, item.stage, item.id).await?;
        }
        Ok(item)
    }

    /// Record a failed attempt.
    ///
    /// `expected_attempts` is the counter the caller read; a concurrent
    /// change, or a claim no longer held by `expected_worker`, makes this
    /// return [`DbError::Conflict`]. Below `max_attempts` the item returns
    /// to `waiting` and becomes claimable at `retry_at`.
    #[allow(clippy::too_many_arguments)]
    pub async fn fail(
        &self,
        id: ItemId,
        expected_worker: Option<&str>,
        expected_attempts: u32,
        max_attempts: u32,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, DbError> {
        let attempts = expected_attempts.saturating_add(1);
        let exhausted = attempts >= max_attempts;
        let guard = holder_guard(expected_worker);

        let query = if exhausted {
            format!(
                r#"
                UPDATE type::thing('queue_item', $item_id)
                SET status = 'failed', worker_id = NONE, claim_expires_at = NONE,
                    attempts = $attempts, last_error = $error, updated_at = $now
                WHERE {guard} AND attempts = $expected
                RETURN AFTER
                "#
            )
        } else {
            format!(
                r#"
                UPDATE type::thing('queue_item', $item_id)
                SET status = 'waiting', worker_id = NONE, claimed_at = NONE,
                    claim_expires_at = NONE, available_at = $retry_at,
                    attempts = $attempts, last_error = $error, updated_at = $now
                WHERE {guard} AND attempts = $expected
                RETURN AFTER
                "#
            )
        };

        let mut request = self
            .db
            .client()
            .query(query)
            .bind(("item_id", id.to_string()))
            .bind(("attempts", attempts))
            .bind(("expected", expected_attempts))
            .bind(("error", error.to_string()))
            .bind(("retry_at", to_millis(retry_at)))
            .bind(("now", to_millis(now)));
        if let Some(worker) = expected_worker {
            request = request.bind(("expected_worker", worker.to_string()));
        }

        let mut result = request.await?;

        let records: Vec<QueueItemRecord> = result.take(0)?;
        let Some(item) = first_item(records)? else {
            return Err(DbError::Conflict(format!(
                "Queue item {} changed while recording a failure",
                id
            )));
        };

        if exhausted {
            self.release_slot(item.job_id, item.stage, item.id).await?;
            Ok(FailOutcome::Exhausted(item))
        } else {
            Ok(FailOutcome::Retrying(item))
        }
    }

    /// Release a claim without counting an attempt.
    ///
    /// `claim_expires_at` and `available_at` both become `cooldown_until`.
    /// When `expected_worker` is given the release only applies while that
    /// worker still holds the item. Returns `None` if nothing was released.
    pub async fn release(
        &self,
        id: ItemId,
        expected_worker: Option<&str>,
        cooldown_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, DbError> {
        let guard = if expected_worker.is_some() {
            "status = 'claimed' AND worker_id = $expected_worker"
        } else {
            "status = 'claimed'"
        };

        let query = format!(
            r#"
            UPDATE type::thing('queue_item', $item_id)
            SET status = 'waiting', worker_id = NONE, claimed_at = NONE,
                claim_expires_at = $cooldown, available_at = $cooldown, updated_at = $now
            WHERE {guard}
            RETURN AFTER
            "#
        );

        let mut request = self
            .db
            .client()
            .query(query)
            .bind(("item_id", id.to_string()))
            .bind(("cooldown", to_millis(cooldown_until)))
            .bind(("now", to_millis(now)));

        if let Some(worker) = expected_worker {
            request = request.bind(("expected_worker", worker.to_string()));
        }

        let mut result = request.await?;
        let records: Vec<QueueItemRecord> = result.take(0)?;
        first_item(records)
    }

    /// Items that currently have a worker attached, optionally for one job.
    pub async fn list_claimed(&self, job_id: Option<JobId>) -> Result<Vec<QueueItem>, DbError> {
        let mut result = match job_id {
            Some(job_id) => {
                self.db
                    .client()
                    .query(
                        "SELECT * FROM queue_item WHERE worker_id != NONE AND job_id = $job_id ORDER BY created_at ASC",
                    )
                    .bind(("job_id", job_id.to_string()))
                    .await?
            }
            None => {
                self.db
                    .client()
                    .query("SELECT * FROM queue_item WHERE worker_id != NONE ORDER BY created_at ASC")
                    .await?
            }
        };

        let records: Vec<QueueItemRecord> = result.take(0)?;
        into_items(records)
    }

    /// Fail every waiting or claimed item of a job and free their slots.
    pub async fn fail_active_for_job(
        &self,
        job_id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, DbError> {
        let query = format!(
            r#"
            UPDATE queue_item
            SET status = 'failed', worker_id = NONE, claim_expires_at = NONE,
                last_error = $reason, updated_at = $now
            WHERE job_id = $job_id AND status IN {ACTIVE}
            RETURN AFTER;
            DELETE queue_slot WHERE job_id = $job_id;
            "#
        );
        let mut result = self
            .db
            .client()
            .query(query)
            .bind(("job_id", job_id.to_string()))
            .bind(("reason", reason.to_string()))
            .bind(("now", to_millis(now)))
            .await?;

        let records: Vec<QueueItemRecord> = result.take(0)?;
        into_items(records)
    }

    /// Item counts grouped by stage and status.
    pub async fn count_by_stage(&self) -> Result<Vec<(Stage, ItemStatus, u64)>, DbError> {
        let mut result = self
            .db
            .client()
            .query("SELECT stage, status, count() AS count FROM queue_item GROUP BY stage, status")
            .await?;

        #[derive(Deserialize)]
        struct StageCount {
            stage: Option<Stage>,
            status: Option<ItemStatus>,
            count: i64,
        }

        let counts: Vec<StageCount> = result.take(0)?;

        Ok(counts
            .into_iter()
            .filter_map(|c| match (c.stage, c.status) {
                (Some(stage), Some(status)) => Some((stage, status, c.count.max(0) as u64)),
                _ => None,
            })
            .collect())
    }
}
