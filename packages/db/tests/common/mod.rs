use chrono::{DateTime, TimeZone, Utc};
use db::{Database, DbError};
use pipeline_core::{Job, NewJob, Priority};

/// A fresh in-memory store per test; `mem://` connections do not share data.
pub async fn setup_db() -> Result<Database, DbError> {
    Database::memory().await
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn new_job(title: &str, priority: Priority) -> Job {
    Job::new(NewJob::new(title).with_owner("user-1").with_priority(priority), t0())
}
