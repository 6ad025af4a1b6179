//! Pipeline initialization from the environment.

use std::sync::Arc;

use actors::{JobQueueService, PoolConfig, QueueConfig, StageHandlerRegistry, WorkerPoolManager};
use db::DbConfig;

use crate::error::InitError;
use crate::state::AdminState;

/// Connect the store, build the queue service and start the worker pool.
///
/// Reads `DbConfig`, `QueueConfig` and `PoolConfig` from the environment.
/// Should be called once at server startup.
pub async fn init_pipeline(handlers: StageHandlerRegistry) -> Result<AdminState, InitError> {
    tracing::info!("Initializing video pipeline...");

    let db_config = DbConfig::from_env();
    let queue_config = QueueConfig::from_env()?;
    let pool_config = PoolConfig::from_env()?;

    let db = db::init(db_config).await?;
    let service = JobQueueService::new(db, queue_config);

    let pool = Arc::new(WorkerPoolManager::new(service, handlers));
    pool.start(pool_config.clone()).await?;

    tracing::info!("Video pipeline initialized");
    Ok(AdminState::new(pool, pool_config))
}
