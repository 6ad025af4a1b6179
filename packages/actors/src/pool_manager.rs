//! Worker pool manager: owns the per-stage worker actors and the sweeper.
//!
//! The manager is an ordinary value; construct one per process and hand it
//! to whatever needs to control the pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pipeline_core::Stage;
use ractor::{Actor, ActorRef};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::handler::StageHandlerRegistry;
use crate::messages::{SweeperMessage, WorkerMessage};
use crate::service::JobQueueService;
use crate::sweeper::{RecoverySweeper, SweeperArgs};
use crate::worker_actor::{SharedWorkerRecord, WorkerActor, WorkerArgs, WorkerRecord};

/// How to treat the in-flight item of a removed worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoveMode {
    /// Let the current item finish first.
    #[default]
    Graceful,
    /// Stop immediately; the claim is left for the recovery sweep.
    Abandon,
}

/// Worker counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageWorkers {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
}

/// Aggregate pool health.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub pool_running: bool,
    pub total_workers: usize,
    pub running_workers: usize,
    pub healthy_workers: usize,
    pub workers_by_stage: BTreeMap<Stage, StageWorkers>,
    /// Seconds since the pool was last started.
    pub system_uptime_secs: u64,
    pub last_health_check: DateTime<Utc>,
}

/// Snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub record: WorkerRecord,
    pub healthy: bool,
    pub uptime_secs: u64,
}

struct WorkerHandle {
    stage: Stage,
    actor: ActorRef<WorkerMessage>,
    join: JoinHandle<()>,
    record: SharedWorkerRecord,
}

#[derive(Default)]
struct PoolState {
    running: bool,
    config: Option<PoolConfig>,
    started_at: Option<DateTime<Utc>>,
    workers: BTreeMap<String, WorkerHandle>,
    counters: HashMap<Stage, u64>,
    sweeper: Option<(ActorRef<SweeperMessage>, JoinHandle<()>)>,
}

/// Supervises the worker actors of every stage.
pub struct WorkerPoolManager {
    service: JobQueueService,
    handlers: StageHandlerRegistry,
    /// Serializes start/stop/add/remove/restart.
    lifecycle: Mutex<()>,
    /// Never held across an await.
    state: RwLock<PoolState>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
}

fn whole_secs(span: chrono::Duration) -> u64 {
    u64::try_from(span.num_seconds()).unwrap_or(0)
}

impl WorkerPoolManager {
    pub fn new(service: JobQueueService, handlers: StageHandlerRegistry) -> Self {
        Self {
            service,
            handlers,
            lifecycle: Mutex::new(()),
            state: RwLock::new(PoolState::default()),
            last_health_check: RwLock::new(None),
        }
    }

    pub fn service(&self) -> &JobQueueService {
        &self.service
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    /// Configuration of the current or most recent run.
    pub fn config(&self) -> Option<PoolConfig> {
        self.state.read().config.clone()
    }

    /// Spawn the configured workers and, if enabled, the recovery sweeper.
    ///
    /// Fails without starting anything if the config is invalid or a stage
    /// with workers has no handler.
    pub async fn start(&self, config: PoolConfig) -> Result<(), PoolError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state.read().running {
            return Err(PoolError::AlreadyRunning);
        }

        config.validate()?;
        if let Some(stage) = self.handlers.first_missing(config.active_stages()) {
            return Err(PoolError::MissingHandler(stage));
        }

        {
            let mut state = self.state.write();
            state.running = true;
            state.config = Some(config.clone());
            state.started_at = Some(self.service.now());
        }

        for (stage, count) in &config.workers {
            for _ in 0..*count {
                if let Err(e) = self.spawn_worker(*stage, &config, None).await {
                    tracing::error!("Failed to start worker pool: {}", e);
                    self.shutdown().await;
                    return Err(e);
                }
            }
        }

        if let Some(interval) = config.sweep_interval {
            let args = SweeperArgs {
                service: self.service.clone(),
                interval,
                stuck_minutes: config.stuck_minutes,
            };
            match Actor::spawn(None, RecoverySweeper, args).await {
                Ok(sweeper) => self.state.write().sweeper = Some(sweeper),
                Err(e) => {
                    self.shutdown().await;
                    return Err(e.into());
                }
            }
        }

        let total = self.state.read().workers.len();
        tracing::info!("Worker pool started with {} workers", total);
        Ok(())
    }

    /// Stop every worker after its in-flight item, then the sweeper.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.state.read().running {
            return Err(PoolError::NotRunning);
        }

        self.shutdown().await;
        tracing::info!("Worker pool stopped");
        Ok(())
    }

    /// Stop and start again with the most recent configuration.
    pub async fn restart(&self) -> Result<(), PoolError> {
        let config = self.config().ok_or(PoolError::NotRunning)?;

        match self.stop().await {
            Ok(()) | Err(PoolError::NotRunning) => {}
            Err(e) => return Err(e),
        }

        self.start(config).await
    }

    /// Add one worker for `stage`. Returns its id.
    pub async fn add_worker(&self, stage: Stage) -> Result<String, PoolError> {
        let _lifecycle = self.lifecycle.lock().await;

        let config = {
            let state = self.state.read();
            if !state.running {
                return Err(PoolError::NotRunning);
            }
            state.config.clone().unwrap_or_default()
        };

        let worker_id = self.spawn_worker(stage, &config, None).await?;
        tracing::info!(%stage, "Added worker {}", worker_id);
        Ok(worker_id)
    }

    /// Remove a worker, waiting for or abandoning its in-flight item.
    pub async fn remove_worker(&self, worker_id: &str, mode: RemoveMode) -> Result<(), PoolError> {
        let _lifecycle = self.lifecycle.lock().await;

        let handle = self
            .state
            .write()
            .workers
            .remove(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;

        Self::halt(handle, mode).await;
        tracing::info!(mode = ?mode, "Removed worker {}", worker_id);
        Ok(())
    }

    /// Gracefully stop a worker and start a fresh one under the same id.
    pub async fn restart_worker(&self, worker_id: &str) -> Result<(), PoolError> {
        let _lifecycle = self.lifecycle.lock().await;

        let (handle, config) = {
            let mut state = self.state.write();
            let handle = state
                .workers
                .remove(worker_id)
                .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;
            (handle, state.config.clone().unwrap_or_default())
        };

        let stage = handle.stage;
        Self::halt(handle, RemoveMode::Graceful).await;
        self.spawn_worker(stage, &config, Some(worker_id.to_string()))
            .await?;

        tracing::info!(%stage, "Restarted worker {}", worker_id);
        Ok(())
    }

    /// Aggregate worker counts and health.
    pub fn get_system_health(&self) -> SystemHealth {
        let now = self.service.now();
        let state = self.state.read();
        let window = Self::health_window(&state);

        let mut health = SystemHealth {
            pool_running: state.running,
            total_workers: 0,
            running_workers: 0,
            healthy_workers: 0,
            workers_by_stage: BTreeMap::new(),
            system_uptime_secs: state
                .started_at
                .filter(|_| state.running)
                .map_or(0, |started| whole_secs(now - started)),
            last_health_check: now,
        };

        for handle in state.workers.values() {
            let record = handle.record.read();
            let healthy = record.is_healthy(now, window);
            let stage = health.workers_by_stage.entry(record.stage).or_default();

            health.total_workers += 1;
            stage.total += 1;
            if record.running {
                health.running_workers += 1;
                stage.running += 1;
            }
            if healthy {
                health.healthy_workers += 1;
                stage.healthy += 1;
            }
        }
        drop(state);

        *self.last_health_check.write() = Some(now);
        health
    }

    /// When health was last computed.
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.read()
    }

    /// Snapshots of every worker, ordered by id.
    pub fn get_worker_statuses(&self) -> Vec<WorkerStatus> {
        let now = self.service.now();
        let state = self.state.read();
        let window = Self::health_window(&state);

        state
            .workers
            .values()
            .map(|handle| Self::status(&handle.record, now, window))
            .collect()
    }

    /// Snapshot of one worker.
    pub fn get_worker_details(&self, worker_id: &str) -> Option<WorkerStatus> {
        let now = self.service.now();
        let state = self.state.read();
        let window = Self::health_window(&state);

        state
            .workers
            .get(worker_id)
            .map(|handle| Self::status(&handle.record, now, window))
    }

    fn status(
        record: &SharedWorkerRecord,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> WorkerStatus {
        let record = record.read().clone();
        WorkerStatus {
            healthy: record.is_healthy(now, window),
            uptime_secs: whole_secs(now - record.started_at),
            record,
        }
    }

    fn health_window(state: &PoolState) -> chrono::Duration {
        let window = state
            .config
            .as_ref()
            .map(|config| config.health_window)
            .unwrap_or_else(|| PoolConfig::default().health_window);
        chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
    }

    fn next_worker_id(&self, stage: Stage) -> String {
        let mut state = self.state.write();
        loop {
            let counter = state.counters.entry(stage).or_insert(0);
            *counter += 1;
            let id = format!("{}-worker-{}", stage, counter);
            if !state.workers.contains_key(&id) {
                return id;
            }
        }
    }

    async fn spawn_worker(
        &self,
        stage: Stage,
        config: &PoolConfig,
        worker_id: Option<String>,
    ) -> Result<String, PoolError> {
        let handler = self
            .handlers
            .get(stage)
            .ok_or(PoolError::MissingHandler(stage))?;

        let worker_id = worker_id.unwrap_or_else(|| self.next_worker_id(stage));
        let record = Arc::new(RwLock::new(WorkerRecord::new(
            worker_id.clone(),
            stage,
            self.service.now(),
        )));

        let args = WorkerArgs {
            worker_id: worker_id.clone(),
            stage,
            service: self.service.clone(),
            handler,
            lease: config.lease,
            handler_timeout: config.handler_timeout,
            poll_interval: config.poll_interval,
            record: record.clone(),
        };

        let (actor, join) = Actor::spawn(None, WorkerActor, args).await?;

        self.state.write().workers.insert(
            worker_id.clone(),
            WorkerHandle {
                stage,
                actor,
                join,
                record,
            },
        );

        Ok(worker_id)
    }

    async fn halt(handle: WorkerHandle, mode: RemoveMode) {
        match mode {
            RemoveMode::Graceful => handle.actor.stop(None),
            RemoveMode::Abandon => handle.actor.kill(),
        }
        if let Err(e) = handle.join.await {
            tracing::warn!("Worker task ended abnormally: {}", e);
        }
        handle.record.write().running = false;
    }

    /// Tear everything down. Callers hold the lifecycle lock.
    async fn shutdown(&self) {
        let (workers, sweeper) = {
            let mut state = self.state.write();
            state.running = false;
            (
                std::mem::take(&mut state.workers),
                state.sweeper.take(),
            )
        };

        if let Some((sweeper, join)) = sweeper {
            sweeper.stop(None);
            let _ = join.await;
        }

        // Signal every worker first so they wind down in parallel.
        for handle in workers.values() {
            handle.actor.stop(None);
        }
        for (_, handle) in workers {
            if let Err(e) = handle.join.await {
                tracing::warn!("Worker task ended abnormally: {}", e);
            }
            handle.record.write().running = false;
        }
    }
}
