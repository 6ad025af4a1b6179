#![allow(clippy::disallowed_methods)]

mod common;

use chrono::Duration;
use pipeline_core::{
    ItemStatus, JobStatus, LogEntry, LogLevel, NewVideoChunk, Priority, QueueItem, Stage,
};
use serde_json::json;
use std::error::Error;

use db::{
    ChunkRepository, DbError, FailOutcome, JobFilter, JobRepository, LogRepository,
    QueueItemRepository,
};

use common::{new_job, setup_db, t0};

#[tokio::test]
async fn test_job_repository() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let jobs = JobRepository::new(db);

    let job = new_job("Trip", Priority::Normal);
    let created = jobs.create(&job).await?;
    assert_eq!(created, job);

    let loaded = jobs.get(job.id).await?;
    assert_eq!(loaded.title, "Trip");
    assert_eq!(loaded.status, JobStatus::Pending);

    let other = new_job("Other", Priority::Low);
    jobs.create(&other).await?;

    let listed = jobs.list(&JobFilter::owner("user-1")).await?;
    assert_eq!(listed.len(), 2);
    let none = jobs.list(&JobFilter::owner("nobody")).await?;
    assert!(none.is_empty());
    let limited = jobs.list(&JobFilter::default().with_limit(1)).await?;
    assert_eq!(limited.len(), 1);

    let later = t0() + Duration::seconds(5);
    let processing = jobs.mark_processing(job.id, later).await?;
    assert_eq!(processing.map(|j| j.status), Some(JobStatus::Processing));
    // already processing
    assert!(jobs.mark_processing(job.id, later).await?.is_none());

    let updated = jobs
        .record_stage_result(job.id, Stage::Upload, json!({"bytes": 10}), 14, later)
        .await?;
    assert_eq!(updated.progress_percentage, 14);
    assert_eq!(updated.stage_result(Stage::Upload), Some(&json!({"bytes": 10})));

    // a later stage keeps earlier results and a lower progress is ignored
    let updated = jobs
        .record_stage_result(job.id, Stage::SplitChunks, json!({"chunks": 3}), 5, later)
        .await?;
    assert_eq!(updated.progress_percentage, 14);
    assert_eq!(updated.stage_result(Stage::Upload), Some(&json!({"bytes": 10})));
    assert_eq!(updated.stage_result(Stage::SplitChunks), Some(&json!({"chunks": 3})));

    let completed = jobs.mark_completed(job.id, later).await?;
    let completed = completed.ok_or("job should complete")?;
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.progress_percentage, 100);
    assert_eq!(completed.completed_at, Some(later));
    // terminal jobs are not cancelled
    assert!(jobs.mark_cancelled(job.id, later).await?.is_none());

    let counts = jobs.count_by_status().await?;
    assert_eq!(counts.get(&JobStatus::Completed), Some(&1));
    assert_eq!(counts.get(&JobStatus::Pending), Some(&1));

    let finished = jobs.finished_before(later + Duration::seconds(1)).await?;
    assert_eq!(finished, vec![job.id]);

    jobs.delete(job.id).await?;
    assert!(jobs.find(job.id).await?.is_none());
    assert!(matches!(jobs.delete(job.id).await, Err(DbError::NotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_enqueue_rejects_second_active_item() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let jobs = JobRepository::new(db.clone());
    let items = QueueItemRepository::new(db);

    let job = new_job("Double", Priority::Normal);
    jobs.create(&job).await?;

    let first = QueueItem::new(job.id, Stage::QueueAnalysis, json!({}), job.priority, t0());
    items.enqueue(&first).await?;

    let second = QueueItem::new(job.id, Stage::QueueAnalysis, json!({}), job.priority, t0());
    let result = items.enqueue(&second).await;
    assert!(matches!(result, Err(DbError::AlreadyExists(_))));

    let all = items.list_for_job(job.id).await?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, first.id);

    let job = jobs.get(job.id).await?;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.current_stage, Some(Stage::QueueAnalysis));

    // once the item is done the pair may be enqueued again
    items.complete(first.id, None, t0()).await?;
    items.enqueue(&second).await?;
    let active = items.find_active(job.id, Stage::QueueAnalysis).await?;
    assert_eq!(active.map(|i| i.id), Some(second.id));

    Ok(())
}

#[tokio::test]
async fn test_claim_order_and_conditional_claim() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let jobs = JobRepository::new(db.clone());
    let items = QueueItemRepository::new(db);

    let mut queued = Vec::new();
    for (offset, priority) in [(0, Priority::Low), (1, Priority::High), (2, Priority::High)] {
        let job = new_job("Clip", priority);
        jobs.create(&job).await?;
        let item = QueueItem::new(
            job.id,
            Stage::Upload,
            json!({}),
            priority,
            t0() + Duration::seconds(offset),
        );
        items.enqueue(&item).await?;
        queued.push(item);
    }

    let now = t0() + Duration::seconds(10);
    let order: Vec<_> = items
        .claim_candidates(Stage::Upload, now, 10)
        .await?
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(order, vec![queued[1].id, queued[2].id, queued[0].id]);

    let expires = now + Duration::seconds(30);
    let claimed = items
        .try_claim(queued[1].id, "upload-worker-1", now, expires)
        .await?;
    let claimed = claimed.ok_or("first claim should win")?;
    assert_eq!(claimed.status, ItemStatus::Claimed);
    assert_eq!(claimed.worker_id.as_deref(), Some("upload-worker-1"));
    assert_eq!(claimed.claim_expires_at, Some(expires));

    let lost = items
        .try_claim(queued[1].id, "upload-worker-2", now, expires)
        .await?;
    assert!(lost.is_none());

    // items for other stages are not candidates
    assert!(items.claim_candidates(Stage::RenderVideo, now, 10).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_fail_release_and_counts() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let jobs = JobRepository::new(db.clone());
    let items = QueueItemRepository::new(db);

    let job = new_job("Flaky", Priority::Normal);
    jobs.create(&job).await?;
    let item = QueueItem::new(job.id, Stage::AiAnalysis, json!({"n": 1}), job.priority, t0());
    items.enqueue(&item).await?;

    let now = t0() + Duration::seconds(1);
    items
        .try_claim(item.id, "w1", now, now + Duration::seconds(30))
        .await?
        .ok_or("claim")?;

    let retry_at = now + Duration::seconds(2);
    // only the claim holder may resolve the item
    assert!(items.complete(item.id, Some("w2"), now).await?.is_none());
    let foreign = items
        .fail(item.id, Some("w2"), 0, 2, "boom", retry_at, now)
        .await;
    assert!(matches!(foreign, Err(DbError::Conflict(_))));

    let outcome = items
        .fail(item.id, Some("w1"), 0, 2, "boom", retry_at, now)
        .await?;
    assert!(outcome.will_retry());
    let retried = outcome.item();
    assert_eq!(retried.status, ItemStatus::Waiting);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.worker_id, None);
    assert_eq!(retried.available_at, retry_at);
    assert!(items.claim_candidates(Stage::AiAnalysis, now, 10).await?.is_empty());

    // a stale attempt counter loses
    let stale = items.fail(item.id, None, 0, 2, "boom", retry_at, now).await;
    assert!(matches!(stale, Err(DbError::Conflict(_))));

    let outcome = items
        .fail(item.id, None, 1, 2, "boom again", retry_at, now)
        .await?;
    let FailOutcome::Exhausted(failed) = outcome else {
        panic!("second failure should exhaust attempts");
    };
    assert_eq!(failed.status, ItemStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert!(items.find_active(job.id, Stage::AiAnalysis).await?.is_none());

    // release only applies to claimed items
    let other = QueueItem::new(job.id, Stage::RenderVideo, json!({}), job.priority, t0());
    items.enqueue(&other).await?;
    assert!(items.release(other.id, None, now, now).await?.is_none());
    items
        .try_claim(other.id, "w2", now, now + Duration::seconds(30))
        .await?
        .ok_or("claim")?;
    assert!(items.release(other.id, Some("w3"), now, now).await?.is_none());
    let cooldown = now + Duration::seconds(5);
    let released = items.release(other.id, Some("w2"), cooldown, now).await?;
    let released = released.ok_or("release")?;
    assert_eq!(released.status, ItemStatus::Waiting);
    assert_eq!(released.attempts, 0);
    assert_eq!(released.claim_expires_at, Some(cooldown));
    assert!(items.list_claimed(None).await?.is_empty());

    let counts = items.count_by_stage().await?;
    assert!(counts.contains(&(Stage::AiAnalysis, ItemStatus::Failed, 1)));
    assert!(counts.contains(&(Stage::RenderVideo, ItemStatus::Waiting, 1)));

    let cancelled = items.fail_active_for_job(job.id, "cancelled", now).await?;
    assert_eq!(cancelled.len(), 1);
    assert!(items.find_active(job.id, Stage::RenderVideo).await?.is_none());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_stage_results_are_all_kept() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let jobs = JobRepository::new(db);
    let stages = [Stage::QueueAnalysis, Stage::AiAnalysis, Stage::AssembleTimeline];

    for round in 0..20 {
        let job = new_job("Parallel", Priority::Normal);
        jobs.create(&job).await?;
        let job_id = job.id;

        let mut tasks = Vec::new();
        for stage in stages {
            let jobs = jobs.clone();
            tasks.push(tokio::spawn(async move {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match jobs
                        .record_stage_result(job_id, stage, json!({ "round": round }), 50, t0())
                        .await
                    {
                        Err(e) if e.is_conflict() && attempt < 5 => continue,
                        other => return other,
                    }
                }
            }));
        }
        for task in tasks {
            task.await??;
        }

        let stored = jobs.get(job.id).await?;
        for stage in stages {
            assert_eq!(
                stored.stage_result(stage),
                Some(&json!({ "round": round })),
                "round {} lost the {} result",
                round,
                stage
            );
        }
    }

    Ok(())
}

#[tokio::test]
async fn test_logs_and_chunks() -> Result<(), Box<dyn Error>> {
    let db = setup_db().await?;
    let jobs = JobRepository::new(db.clone());
    let logs = LogRepository::new(db.clone());
    let chunks = ChunkRepository::new(db);

    let job = new_job("Chunks", Priority::Normal);
    jobs.create(&job).await?;

    logs.append(&LogEntry::info(job.id, "created", t0())).await?;
    logs.append(
        &LogEntry::warn(job.id, "lease expired", t0() + Duration::seconds(1))
            .with_stage(Stage::Upload)
            .with_metadata(json!({"worker_id": "w1"})),
    )
    .await?;

    let entries = logs.list_for_job(job.id, None).await?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].level, LogLevel::Warn);
    assert_eq!(entries[1].stage, Some(Stage::Upload));
    assert_eq!(logs.list_for_job(job.id, Some(1)).await?.len(), 1);

    let stored = chunks
        .insert_many(
            job.id,
            vec![
                NewVideoChunk::new(1, 10.0, 20.0),
                NewVideoChunk::new(0, 0.0, 10.0).with_storage_path("chunks/0.mp4"),
            ],
            t0(),
        )
        .await?;
    assert_eq!(stored.len(), 2);

    let listed = chunks.list_for_job(job.id).await?;
    assert_eq!(listed.iter().map(|c| c.chunk_index).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(listed[0].storage_path.as_deref(), Some("chunks/0.mp4"));

    let duplicate = chunks
        .insert_many(job.id, vec![NewVideoChunk::new(0, 0.0, 5.0)], t0())
        .await;
    assert!(duplicate.is_err());

    // deleting the job removes its dependent rows
    jobs.delete(job.id).await?;
    assert!(logs.list_for_job(job.id, None).await?.is_empty());
    assert!(chunks.list_for_job(job.id).await?.is_empty());

    Ok(())
}
