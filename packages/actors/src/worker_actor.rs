//! Worker actor bound to one pipeline stage.
//!
//! A worker polls its stage, processes at most one claimed item at a time and
//! reports the outcome through the queue service. Handler errors, panics,
//! timeouts and store errors are logged; none of them stops the worker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::RwLock;
use pipeline_core::{ItemId, JobEvent, QueueItem, Stage};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde::Serialize;

use crate::error::QueueError;
use crate::handler::{HandlerError, HandlerResult, StageContext, StageHandler};
use crate::messages::WorkerMessage;
use crate::service::JobQueueService;

/// Process-local bookkeeping for one worker, owned by the pool manager.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: String,
    pub stage: Stage,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub items_processed: u64,
    pub items_failed: u64,
    /// Item being executed right now.
    pub current_item: Option<ItemId>,
    pub last_error: Option<String>,
}

impl WorkerRecord {
    pub fn new(id: impl Into<String>, stage: Stage, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            stage,
            running: false,
            started_at,
            last_poll_at: None,
            consecutive_failures: 0,
            items_processed: 0,
            items_failed: 0,
            current_item: None,
            last_error: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current_item.is_some()
    }

    /// Running and either executing an item or polled within `window`.
    pub fn is_healthy(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.running
            && (self.is_busy() || self.last_poll_at.is_some_and(|at| now - at <= window))
    }
}

/// Shared handle to a worker's record.
pub type SharedWorkerRecord = Arc<RwLock<WorkerRecord>>;

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub stage: Stage,
    pub service: JobQueueService,
    pub handler: Arc<dyn StageHandler>,
    pub lease: Duration,
    pub handler_timeout: Duration,
    pub poll_interval: Duration,
    pub record: SharedWorkerRecord,
}

/// State for the worker actor.
pub struct WorkerActorState {
    worker_id: String,
    stage: Stage,
    service: JobQueueService,
    handler: Arc<dyn StageHandler>,
    lease: Duration,
    handler_timeout: Duration,
    poll_interval: Duration,
    record: SharedWorkerRecord,
}

impl WorkerActorState {
    fn update(&self, f: impl FnOnce(&mut WorkerRecord)) {
        f(&mut self.record.write());
    }

    async fn process(&self, item: QueueItem) {
        let attempt = item.attempts + 1;
        self.update(|r| r.current_item = Some(item.id));

        tracing::info!(
            worker_id = %self.worker_id,
            job_id = %item.job_id,
            item_id = %item.id,
            stage = %self.stage,
            attempt,
            "Processing item"
        );

        let ctx = StageContext {
            job_id: item.job_id,
            item_id: item.id,
            stage: self.stage,
            payload: item.payload.clone(),
            attempt,
            worker_id: self.worker_id.clone(),
        };

        match run_handler(self.handler.clone(), ctx, self.handler_timeout).await {
            Ok(output) => {
                if let Some(summary) = &output.summary {
                    tracing::debug!(item_id = %item.id, "Stage output: {}", summary);
                }
                self.succeed(&item, output.output).await;
            }
            Err(error) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    job_id = %item.job_id,
                    item_id = %item.id,
                    stage = %self.stage,
                    "Handler failed: {}",
                    error
                );
                self.update(|r| {
                    r.items_failed += 1;
                    r.consecutive_failures += 1;
                    r.last_error = Some(error.to_string());
                });
                match self
                    .service
                    .fail_item(item.id, &self.worker_id, &error.to_string(), attempt)
                    .await
                {
                    Ok(_) => {}
                    Err(QueueError::ClaimLost { .. }) => {
                        tracing::warn!(
                            worker_id = %self.worker_id,
                            item_id = %item.id,
                            "Claim lost before the failure was recorded"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(item_id = %item.id, "Failed to record item failure: {}", e);
                    }
                }
            }
        }

        self.update(|r| r.current_item = None);
    }

    async fn succeed(&self, item: &QueueItem, output: serde_json::Value) {
        let next_payload = output.clone();

        let job = match self
            .service
            .complete_item(item.id, &self.worker_id, output)
            .await
        {
            Ok(job) => job,
            Err(QueueError::ClaimLost { .. }) => {
                // Recovered and handed to another worker; its result wins.
                tracing::warn!(
                    worker_id = %self.worker_id,
                    item_id = %item.id,
                    "Claim lost, dropping stage output"
                );
                self.update(|r| r.last_error = Some("claim lost".to_string()));
                return;
            }
            Err(e) => {
                tracing::warn!(item_id = %item.id, "Failed to complete item: {}", e);
                self.update(|r| {
                    r.consecutive_failures += 1;
                    r.last_error = Some(e.to_string());
                });
                return;
            }
        };

        self.update(|r| {
            r.items_processed += 1;
            r.consecutive_failures = 0;
        });

        let Some(next) = self.stage.next() else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }

        match self
            .service
            .enqueue_job(job.id, next, next_payload, item.priority)
            .await
        {
            Ok(_) => {}
            Err(QueueError::ActiveItemExists { .. }) => {
                tracing::debug!(job_id = %job.id, stage = %next, "Next stage already enqueued");
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    stage = %next,
                    "Failed to enqueue next stage: {}",
                    e
                );
            }
        }
    }
}

/// Run a handler bounded by `timeout`, turning panics into errors.
async fn run_handler(
    handler: Arc<dyn StageHandler>,
    ctx: StageContext,
    timeout: Duration,
) -> HandlerResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(ctx))) {
        Ok(future) => future,
        Err(panic) => return Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    };

    match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        Err(_) => Err(HandlerError::Timeout(timeout)),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn schedule_poll(myself: &ActorRef<WorkerMessage>, delay: Duration) {
    let myself = myself.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // The worker may have stopped meanwhile.
        let _ = myself.send_message(WorkerMessage::Poll);
    });
}

/// Worker actor that claims and executes items of one stage.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        let now = args.service.now();
        {
            let mut record = args.record.write();
            record.running = true;
            record.started_at = now;
        }

        args.service.emit(JobEvent::WorkerStarted {
            worker_id: args.worker_id.clone(),
            stage: args.stage,
            timestamp: now,
        });

        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            stage: args.stage,
            service: args.service,
            handler: args.handler,
            lease: args.lease,
            handler_timeout: args.handler_timeout,
            poll_interval: args.poll_interval,
            record: args.record,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                let now = state.service.now();
                state.update(|r| r.last_poll_at = Some(now));

                match state
                    .service
                    .claim_next_item(state.stage, &state.worker_id, state.lease)
                    .await
                {
                    Ok(Some(item)) => {
                        state.process(item).await;
                        // More work may be waiting; poll again right away.
                        myself.send_message(WorkerMessage::Poll)?;
                    }
                    Ok(None) => schedule_poll(&myself, state.poll_interval),
                    Err(e) => {
                        tracing::warn!(worker_id = %state.worker_id, "Claim failed: {}", e);
                        state.update(|r| r.last_error = Some(e.to_string()));
                        schedule_poll(&myself, state.poll_interval);
                    }
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Worker stopped: {}", state.worker_id);
        state.update(|r| {
            r.running = false;
            r.current_item = None;
        });
        state.service.emit(JobEvent::WorkerStopped {
            worker_id: state.worker_id.clone(),
            stage: state.stage,
            timestamp: state.service.now(),
        });
        Ok(())
    }
}
