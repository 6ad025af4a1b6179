//! Stage handler trait and registry.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{ItemId, JobId, Stage};
use serde_json::Value;
use thiserror::Error;

/// Input handed to a stage handler for one claimed item.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    pub item_id: ItemId,
    pub stage: Stage,
    /// The item's payload; for later stages, the previous stage's output.
    pub payload: Value,
    /// 1-based attempt number of this run.
    pub attempt: u32,
    pub worker_id: String,
}

/// Successful output of a stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    /// Stored under `result_data[stage]` and passed on as the next stage's payload.
    pub output: Value,
    /// Short human-readable note for the job log.
    pub summary: Option<String>,
}

impl StageOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Why a stage run did not produce output.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Result type for stage handlers.
pub type HandlerResult = Result<StageOutput, HandlerError>;

/// Future type for async stage handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for stage handlers.
///
/// Handlers may be re-invoked for the same item after a stuck claim is
/// recovered, so external side effects should tolerate repeats.
pub trait StageHandler: Send + Sync + 'static {
    /// Process one item and return its output.
    fn handle(&self, ctx: StageContext) -> HandlerFuture;
}

/// Registry mapping each stage to its handler.
#[derive(Default, Clone)]
pub struct StageHandlerRegistry {
    handlers: BTreeMap<Stage, Arc<dyn StageHandler>>,
}

impl std::fmt::Debug for StageHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandlerRegistry")
            .field("stages", &self.stages())
            .finish()
    }
}

impl StageHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Register a handler for a stage, replacing any previous one.
    pub fn register<H: StageHandler>(&mut self, stage: Stage, handler: H) {
        self.handlers.insert(stage, Arc::new(handler));
    }

    /// Register an async closure as the handler for a stage.
    pub fn register_fn<F, Fut>(&mut self, stage: Stage, handler: F)
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(
            stage,
            FnHandler::new(move |ctx| -> HandlerFuture { Box::pin(handler(ctx)) }),
        );
    }

    /// Builder-style [`register_fn`](Self::register_fn).
    pub fn with_fn<F, Fut>(mut self, stage: Stage, handler: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_fn(stage, handler);
        self
    }

    /// Get the handler for a stage.
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    /// Check if a handler exists for a stage.
    pub fn has_handler(&self, stage: Stage) -> bool {
        self.handlers.contains_key(&stage)
    }

    /// Stages with a registered handler, in pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        self.handlers.keys().copied().collect()
    }

    /// First stage of `required` that has no handler.
    pub fn first_missing(&self, required: impl IntoIterator<Item = Stage>) -> Option<Stage> {
        required.into_iter().find(|stage| !self.has_handler(*stage))
    }
}

/// A simple function-based stage handler.
pub struct FnHandler<F>
where
    F: Fn(StageContext) -> HandlerFuture + Send + Sync + 'static,
{
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(StageContext) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> StageHandler for FnHandler<F>
where
    F: Fn(StageContext) -> HandlerFuture + Send + Sync + 'static,
{
    fn handle(&self, ctx: StageContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(stage: Stage) -> StageContext {
        StageContext {
            job_id: JobId::new(),
            item_id: ItemId::new(),
            stage,
            payload: json!({"n": 1}),
            attempt: 1,
            worker_id: "upload-worker-1".into(),
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = StageHandlerRegistry::new()
            .with_fn(Stage::Upload, |ctx| async move {
                Ok(StageOutput::new(json!({"echo": ctx.payload})))
            })
            .with_fn(Stage::RenderVideo, |_| async {
                Err(HandlerError::failed("encoder missing"))
            });

        assert_eq!(registry.stages(), vec![Stage::Upload, Stage::RenderVideo]);
        assert!(!registry.has_handler(Stage::AiAnalysis));
        assert_eq!(
            registry.first_missing([Stage::Upload, Stage::AiAnalysis]),
            Some(Stage::AiAnalysis)
        );

        let upload = registry.get(Stage::Upload).unwrap();
        let output = upload.handle(ctx(Stage::Upload)).await.unwrap();
        assert_eq!(output.output, json!({"echo": {"n": 1}}));

        let render = registry.get(Stage::RenderVideo).unwrap();
        let err = render.handle(ctx(Stage::RenderVideo)).await.unwrap_err();
        assert_eq!(err.to_string(), "encoder missing");
    }
}
