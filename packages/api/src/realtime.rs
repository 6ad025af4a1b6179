//! Real-time event streaming via Server-Sent Events.

use std::convert::Infallible;

use axum::{
    Router,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures_util::stream::{self, Stream};
use pipeline_core::{JobEvent, JobId};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::error::ApiResult;
use crate::jobs::parse_job_id;
use crate::state::AdminState;

/// Create the events router.
pub fn router() -> Router<AdminState> {
    Router::new().route("/", get(stream_events))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only forward events of this job.
    pub job_id: Option<String>,
}

/// Format an event as an SSE frame.
pub fn sse_event(event: &JobEvent) -> Event {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(json)
}

fn wanted(event: &JobEvent, job_id: Option<JobId>) -> bool {
    job_id.is_none_or(|id| event.job_id() == Some(id))
}

async fn stream_events(
    State(state): State<AdminState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let job_id = query.job_id.as_deref().map(parse_job_id).transpose()?;
    let rx = state.service.subscribe();
    let shutdown = state.shutdown_signal();

    let events = stream::unfold((rx, shutdown), move |(mut rx, mut shutdown)| async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => None,
                received = rx.recv() => Some(received),
            };
            match received {
                None | Some(Err(RecvError::Closed)) => return None,
                Some(Ok(event)) if wanted(&event, job_id) => {
                    return Some((Ok(sse_event(&event)), (rx, shutdown)));
                }
                Some(Ok(_)) => {}
                Some(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "SSE subscriber lagged behind");
                }
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipeline_core::Stage;

    #[test]
    fn test_job_filter() {
        let job_id = JobId::new();
        let event = JobEvent::JobCompleted {
            job_id,
            timestamp: Utc::now(),
        };
        let worker = JobEvent::WorkerStarted {
            worker_id: "upload-worker-1".into(),
            stage: Stage::Upload,
            timestamp: Utc::now(),
        };

        assert!(wanted(&event, None));
        assert!(wanted(&event, Some(job_id)));
        assert!(!wanted(&event, Some(JobId::new())));
        assert!(wanted(&worker, None));
        assert!(!wanted(&worker, Some(job_id)));
    }
}
