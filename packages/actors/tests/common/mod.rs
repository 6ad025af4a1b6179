#![allow(dead_code)]

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use actors::{JobQueueService, QueueConfig};
use chrono::{DateTime, TimeZone, Utc};
use db::Database;
use pipeline_core::{ManualClock, NewJob, Priority};

pub type TestResult = Result<(), Box<dyn Error>>;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// A service over a fresh in-memory store, driven by a manual clock.
pub async fn manual_service(
    config: QueueConfig,
) -> Result<(JobQueueService, Arc<ManualClock>), Box<dyn Error>> {
    let db = Database::memory().await?;
    let clock = Arc::new(ManualClock::new(t0()));
    let service = JobQueueService::new(db, config).with_clock(clock.clone());
    Ok((service, clock))
}

/// A service over a fresh in-memory store using wall-clock time.
pub async fn system_service(config: QueueConfig) -> Result<JobQueueService, Box<dyn Error>> {
    let db = Database::memory().await?;
    Ok(JobQueueService::new(db, config))
}

/// No retry back-off so failed items are claimable immediately.
pub fn eager_retries(max_attempts: u32) -> QueueConfig {
    QueueConfig::default()
        .with_max_attempts(max_attempts)
        .with_retry_backoff(Duration::ZERO, Duration::ZERO)
}

pub fn new_job(title: &str, priority: Priority) -> NewJob {
    NewJob::new(title).with_owner("user-1").with_priority(priority)
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
