//! Worker pool tests with real actors and wall-clock time.
#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use actors::{
    HandlerError, JobQueueService, PoolConfig, PoolError, QueueConfig, RemoveMode, StageOutput,
    StageHandlerRegistry, WorkerPoolManager,
};
use common::{TestResult, eager_retries, eventually, new_job, system_service};
use pipeline_core::{ItemStatus, JobId, JobStatus, Priority, Stage};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> PoolConfig {
    PoolConfig::default()
        .with_lease(Duration::from_secs(30))
        .with_handler_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(20))
        .with_sweep_interval(None)
}

/// Only `stages` get one worker each.
fn config_for(stages: &[Stage]) -> PoolConfig {
    stages
        .iter()
        .fold(PoolConfig { workers: Default::default(), ..fast_config() }, |config, stage| {
            config.with_workers(*stage, 1)
        })
}

/// Every stage echoes its payload under its own name.
fn passthrough_handlers() -> StageHandlerRegistry {
    Stage::ALL
        .into_iter()
        .fold(StageHandlerRegistry::new(), |registry, stage| {
            registry.with_fn(stage, move |ctx| async move {
                Ok(StageOutput::new(json!({ "stage": stage.as_str(), "input": ctx.payload }))
                    .with_summary(format!("{} done", stage)))
            })
        })
}

async fn job_status(service: &JobQueueService, job_id: JobId) -> Option<JobStatus> {
    service.get_job(job_id).await.ok().map(|job| job.status)
}

async fn item_status(service: &JobQueueService, job_id: JobId, stage: Stage) -> Option<ItemStatus> {
    service
        .get_job_items(job_id)
        .await
        .ok()?
        .into_iter()
        .find(|item| item.stage == stage)
        .map(|item| item.status)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_runs_to_completion() -> TestResult {
    let service = system_service(QueueConfig::default()).await?;
    let pool = WorkerPoolManager::new(service.clone(), passthrough_handlers());
    pool.start(fast_config()).await?;

    let (job, _) = service
        .submit_job(new_job("End to end", Priority::High), json!({"source": "in.mp4"}))
        .await?;

    let (svc, job_id) = (&service, job.id);
    let done = eventually(WAIT, || async move {
        job_status(svc, job_id).await == Some(JobStatus::Completed)
    })
    .await;
    assert!(done, "job did not complete");

    let job = service.get_job(job.id).await?;
    assert_eq!(job.progress_percentage, 100);
    assert!(job.completed_at.is_some());
    assert_eq!(job.result_data.len(), Stage::ALL.len());

    // Each stage received the previous stage's output.
    let split = job.stage_result(Stage::SplitChunks).ok_or("missing split result")?;
    assert_eq!(split["input"]["stage"], json!("upload"));
    assert_eq!(split["input"]["input"], json!({"source": "in.mp4"}));

    let items = service.get_job_items(job.id).await?;
    assert_eq!(items.len(), Stage::ALL.len());
    assert!(items.iter().all(|item| item.status == ItemStatus::Done));
    assert!(items.iter().all(|item| item.priority == Priority::High));

    pool.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_handler_is_retried() -> TestResult {
    let service = system_service(eager_retries(3)).await?;
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let handlers = StageHandlerRegistry::new().with_fn(Stage::Upload, move |ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(HandlerError::failed("transient storage error"));
            }
            Ok(StageOutput::new(json!({ "attempt": ctx.attempt })))
        }
    });

    let pool = WorkerPoolManager::new(service.clone(), handlers);
    pool.start(config_for(&[Stage::Upload])).await?;

    let (job, item) = service
        .submit_job(new_job("Flaky", Priority::Normal), json!({}))
        .await?;

    let (svc, job_id) = (&service, job.id);
    // The next stage is enqueued once the worker has booked the success.
    let done = eventually(WAIT, || async move {
        item_status(svc, job_id, Stage::SplitChunks).await == Some(ItemStatus::Waiting)
    })
    .await;
    assert!(done, "upload did not succeed on retry");

    let item = service.get_item(item.id).await?;
    assert_eq!(item.attempts, 1);

    let job = service.get_job(job.id).await?;
    assert_eq!(job.stage_result(Stage::Upload), Some(&json!({ "attempt": 2 })));
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(
        item_status(&service, job.id, Stage::Upload).await,
        Some(ItemStatus::Done)
    );

    let status = pool
        .get_worker_details("upload-worker-1")
        .ok_or("worker missing")?;
    assert_eq!(status.record.items_failed, 1);
    assert_eq!(status.record.items_processed, 1);
    assert_eq!(status.record.consecutive_failures, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    pool.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panics_and_timeouts_do_not_kill_workers() -> TestResult {
    let service = system_service(eager_retries(2)).await?;
    let handlers = StageHandlerRegistry::new()
        .with_fn(Stage::Upload, |ctx| async move {
            if ctx.payload["panic"] == json!(true) {
                panic!("corrupt container");
            }
            Ok(StageOutput::new(json!({})))
        })
        .with_fn(Stage::SplitChunks, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(StageOutput::default())
        });

    let config = config_for(&[Stage::Upload, Stage::SplitChunks])
        .with_handler_timeout(Duration::from_millis(100));
    let pool = WorkerPoolManager::new(service.clone(), handlers);
    pool.start(config).await?;

    let (bad, _) = service
        .submit_job(new_job("Panics", Priority::Normal), json!({"panic": true}))
        .await?;
    let (svc, job_id) = (&service, bad.id);
    let failed = eventually(WAIT, || async move {
        job_status(svc, job_id).await == Some(JobStatus::Failed)
    })
    .await;
    assert!(failed, "panicking job did not fail");
    let bad = service.get_job(bad.id).await?;
    assert!(bad.last_error.unwrap_or_default().contains("corrupt container"));

    // The same upload worker keeps serving; its job then times out in split.
    let (slow, _) = service
        .submit_job(new_job("Slow", Priority::Normal), json!({}))
        .await?;
    let job_id = slow.id;
    let timed_out = eventually(WAIT, || async move {
        job_status(svc, job_id).await == Some(JobStatus::Failed)
    })
    .await;
    assert!(timed_out, "slow job did not fail");
    let slow = service.get_job(slow.id).await?;
    assert!(slow.last_error.unwrap_or_default().contains("timed out"));

    let health = pool.get_system_health();
    assert_eq!(health.total_workers, 2);
    assert_eq!(health.running_workers, 2);

    pool.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_validation() -> TestResult {
    let service = system_service(QueueConfig::default()).await?;
    let handlers = StageHandlerRegistry::new().with_fn(Stage::Upload, |_| async {
        Ok(StageOutput::default())
    });
    let pool = WorkerPoolManager::new(service, handlers);

    let missing = pool.start(config_for(&[Stage::Upload, Stage::AiAnalysis])).await;
    assert!(matches!(missing, Err(PoolError::MissingHandler(Stage::AiAnalysis))));
    assert!(!pool.is_running());

    let invalid = config_for(&[Stage::Upload]).with_handler_timeout(Duration::from_secs(30));
    assert!(matches!(pool.start(invalid).await, Err(PoolError::Config(_))));

    assert!(matches!(pool.stop().await, Err(PoolError::NotRunning)));
    assert!(matches!(pool.add_worker(Stage::Upload).await, Err(PoolError::NotRunning)));

    pool.start(config_for(&[Stage::Upload])).await?;
    assert!(pool.is_running());
    assert!(matches!(
        pool.start(config_for(&[Stage::Upload])).await,
        Err(PoolError::AlreadyRunning)
    ));

    pool.stop().await?;
    assert!(!pool.is_running());
    assert!(pool.get_worker_statuses().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_lifecycle_and_health() -> TestResult {
    let service = system_service(QueueConfig::default()).await?;
    let pool = WorkerPoolManager::new(service, passthrough_handlers());
    pool.start(config_for(&[Stage::Upload, Stage::AiAnalysis])).await?;

    let added = pool.add_worker(Stage::AiAnalysis).await?;
    assert_eq!(added, "ai_analysis-worker-2");

    let manager = &pool;
    let healthy =
        eventually(WAIT, || async move { manager.get_system_health().healthy_workers == 3 }).await;
    assert!(healthy, "workers never reported healthy");

    let health = pool.get_system_health();
    assert!(health.pool_running);
    assert_eq!(health.total_workers, 3);
    assert_eq!(health.workers_by_stage[&Stage::AiAnalysis].total, 2);
    assert_eq!(health.workers_by_stage[&Stage::Upload].running, 1);
    assert_eq!(pool.last_health_check(), Some(health.last_health_check));

    let ids: Vec<_> = pool
        .get_worker_statuses()
        .into_iter()
        .map(|status| status.record.id)
        .collect();
    assert_eq!(
        ids,
        vec!["ai_analysis-worker-1", "ai_analysis-worker-2", "upload-worker-1"]
    );

    pool.remove_worker(&added, RemoveMode::Graceful).await?;
    assert!(pool.get_worker_details(&added).is_none());
    assert!(matches!(
        pool.remove_worker(&added, RemoveMode::Graceful).await,
        Err(PoolError::WorkerNotFound(_))
    ));

    pool.restart_worker("upload-worker-1").await?;
    let restarted = pool
        .get_worker_details("upload-worker-1")
        .ok_or("restarted worker missing")?;
    assert!(restarted.record.running);
    assert_eq!(restarted.record.stage, Stage::Upload);

    // Fresh ids never reuse a removed worker's number.
    assert_eq!(pool.add_worker(Stage::AiAnalysis).await?, "ai_analysis-worker-3");

    pool.restart().await?;
    assert!(pool.is_running());
    assert_eq!(pool.get_system_health().total_workers, 2);

    pool.stop().await?;
    let health = pool.get_system_health();
    assert!(!health.pool_running);
    assert_eq!(health.total_workers, 0);
    assert_eq!(health.system_uptime_secs, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_stop_finishes_in_flight_item() -> TestResult {
    let service = system_service(QueueConfig::default()).await?;
    let handlers = StageHandlerRegistry::new().with_fn(Stage::Upload, |_| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(StageOutput::new(json!({"uploaded": true})))
    });
    let pool = WorkerPoolManager::new(service.clone(), handlers);
    pool.start(config_for(&[Stage::Upload])).await?;

    let (job, _) = service
        .submit_job(new_job("In flight", Priority::Normal), json!({}))
        .await?;
    let manager = &pool;
    let busy = eventually(WAIT, || async move {
        manager
            .get_worker_details("upload-worker-1")
            .is_some_and(|status| status.record.current_item.is_some())
    })
    .await;
    assert!(busy, "worker never picked up the item");

    pool.stop().await?;

    assert_eq!(
        item_status(&service, job.id, Stage::Upload).await,
        Some(ItemStatus::Done)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_claim_is_recovered() -> TestResult {
    let service = system_service(QueueConfig::default()).await?;
    let handlers = StageHandlerRegistry::new().with_fn(Stage::Upload, |_| async {
        tokio::time::sleep(Duration::from_secs(4)).await;
        Ok(StageOutput::default())
    });
    let pool = WorkerPoolManager::new(service.clone(), handlers);
    pool.start(config_for(&[Stage::Upload])).await?;

    let (job, item) = service
        .submit_job(new_job("Abandoned", Priority::Normal), json!({}))
        .await?;
    let manager = &pool;
    let busy = eventually(WAIT, || async move {
        manager
            .get_worker_details("upload-worker-1")
            .is_some_and(|status| status.record.current_item.is_some())
    })
    .await;
    assert!(busy, "worker never picked up the item");

    pool.remove_worker("upload-worker-1", RemoveMode::Abandon).await?;

    let stranded = service.get_item(item.id).await?;
    assert_eq!(stranded.status, ItemStatus::Claimed);
    assert_eq!(stranded.worker_id.as_deref(), Some("upload-worker-1"));

    assert_eq!(service.recover_job(job.id).await?, 1);
    let recovered = service.get_item(item.id).await?;
    assert_eq!(recovered.status, ItemStatus::Waiting);
    assert_eq!(recovered.attempts, 0);

    pool.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweeper_releases_expired_claims() -> TestResult {
    let service = system_service(QueueConfig::default()).await?;
    let pool = WorkerPoolManager::new(service.clone(), StageHandlerRegistry::new());
    pool.start(
        PoolConfig::empty()
            .with_lease(Duration::from_secs(2))
            .with_handler_timeout(Duration::from_secs(1))
            .with_sweep_interval(Some(Duration::from_millis(100))),
    )
    .await?;

    let (job, item) = service
        .submit_job(new_job("Ghost", Priority::Normal), json!({}))
        .await?;
    service
        .claim_next_item(Stage::Upload, "ghost-worker", Duration::from_millis(200))
        .await?
        .ok_or("nothing claimed")?;

    let (svc, item_id) = (&service, item.id);
    let released = eventually(WAIT, || async move {
        svc.get_item(item_id)
            .await
            .is_ok_and(|item| item.status == ItemStatus::Waiting)
    })
    .await;
    assert!(released, "sweeper did not release the claim");

    let logs = service.get_job_logs(job.id, None).await?;
    assert!(logs.iter().any(|log| log.message.contains("ghost-worker")));

    pool.stop().await?;
    Ok(())
}
