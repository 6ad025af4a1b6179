//! Demo stage handlers.
//!
//! Each stage waits `PIPELINE_DEMO_DELAY_MS` (default 200) and forwards its
//! payload. Real deployments register their own handlers instead.

use std::time::Duration;

use actors::{StageContext, StageHandlerRegistry, StageOutput};
use pipeline_core::Stage;
use serde_json::json;

pub fn demo_handlers() -> StageHandlerRegistry {
    let delay = std::env::var("PIPELINE_DEMO_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(200));

    Stage::ALL
        .into_iter()
        .fold(StageHandlerRegistry::new(), |registry, stage| {
            registry.with_fn(stage, move |ctx: StageContext| async move {
                tracing::info!(
                    job_id = %ctx.job_id,
                    %stage,
                    attempt = ctx.attempt,
                    "Demo stage running"
                );
                tokio::time::sleep(delay).await;
                Ok(StageOutput::new(json!({
                    "stage": stage.as_str(),
                    "worker_id": ctx.worker_id,
                    "input": ctx.payload,
                }))
                .with_summary(format!("{} passed through", stage)))
            })
        })
}
