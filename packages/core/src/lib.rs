//! Core domain types for the video pipeline job queue.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and Priority for user-initiated pipeline work
//! - Stage for the fixed pipeline order
//! - QueueItem and QueueStats for per-stage work units
//! - LogEntry and VideoChunk for append-only bookkeeping
//! - Events for real-time updates
//! - Clock for injectable time

mod chunk;
mod clock;
mod error;
mod events;
mod job;
mod log;
mod queue;
mod stage;

pub use chunk::{NewVideoChunk, VideoChunk};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ParseError;
pub use events::JobEvent;
pub use job::{Job, JobId, JobStatus, NewJob, Priority};
pub use log::{LogEntry, LogLevel};
pub use queue::{ItemId, ItemStatus, QueueItem, QueueStats, StageCounts};
pub use stage::Stage;
