//! Shared state of the admin router.

use std::sync::Arc;
use std::time::Instant;

use actors::{JobQueueService, PoolConfig, WorkerPoolManager};
use tokio::sync::watch;

/// State handed to every admin handler.
#[derive(Clone)]
pub struct AdminState {
    pub service: JobQueueService,
    pub pool: Arc<WorkerPoolManager>,
    /// Used by `POST /api/pool/start` when the pool has never run.
    pub pool_config: PoolConfig,
    pub start_time: Instant,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AdminState {
    pub fn new(pool: Arc<WorkerPoolManager>, pool_config: PoolConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            service: pool.service().clone(),
            pool,
            pool_config,
            start_time: Instant::now(),
            shutdown: Arc::new(shutdown),
        }
    }

    /// End every open event stream so the server can drain.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
