//! Actor system for the video pipeline queue.
//!
//! This crate provides the queue service and the Ractor-based worker pool
//! that drives items through the pipeline stages.
//!
//! # Architecture
//!
//! - `JobQueueService` - Creates jobs and performs every queue item transition
//! - `WorkerActor` - Claims and executes items of one stage
//! - `RecoverySweeper` - Periodically releases stuck claims
//! - `WorkerPoolManager` - Starts, scales and monitors the workers
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobQueueService, PoolConfig, QueueConfig, StageHandlerRegistry, WorkerPoolManager};
//!
//! let service = JobQueueService::new(db, QueueConfig::default());
//! let handlers = StageHandlerRegistry::new().with_fn(Stage::Upload, |ctx| async move { ... });
//! let pool = WorkerPoolManager::new(service.clone(), handlers);
//! pool.start(PoolConfig::default()).await?;
//! ```

mod config;
mod error;
mod handler;
mod messages;
mod pool_manager;
mod service;
mod sweeper;
mod worker_actor;

pub use config::{PoolConfig, QueueConfig, parse_workers};
pub use error::{ConfigError, PoolError, QueueError};
pub use handler::{
    FnHandler, HandlerError, HandlerFuture, HandlerResult, StageContext, StageHandler,
    StageHandlerRegistry, StageOutput,
};
pub use messages::{SweeperMessage, WorkerMessage};
pub use pool_manager::{RemoveMode, StageWorkers, SystemHealth, WorkerPoolManager, WorkerStatus};
pub use service::JobQueueService;
pub use sweeper::RecoverySweeper;
pub use worker_actor::{WorkerActor, WorkerRecord};

pub use db::FailOutcome;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
