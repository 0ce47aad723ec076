//! Server-sent event stream of a deployment's log.
//!
//! Frames:
//! - `data: <LogEvent json>` for each event
//! - `event: completion` + `data: {type, message, timestamp}` once the job ends
//! - `: heartbeat` comments while idle
//!
//! A job still tracked by the hub gets its replay buffer and then live events.
//! A job the hub no longer tracks is served its most recent persisted events
//! and a completion frame. An untracked job that never finished was cut off by
//! a restart, so its stream reports it as interrupted.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::{stream, Stream, StreamExt};
use tracing::{debug, warn};

use crate::core::HubMessage;
use crate::domain::{CompletionEvent, Job, JobStatus, LogEvent, Outcome};

use super::auth::RequireAuth;
use super::error::ApiError;
use super::routes::find_job;
use super::AppState;

/// Render one hub message as an SSE frame
pub fn to_sse_event(message: &HubMessage) -> Option<Event> {
    match message {
        HubMessage::Event(event) => serde_json::to_string(event)
            .ok()
            .map(|json| Event::default().data(json)),
        HubMessage::Completion(completion) => serde_json::to_string(completion)
            .ok()
            .map(|json| Event::default().event("completion").data(json)),
        HubMessage::Heartbeat => Some(Event::default().comment("heartbeat")),
    }
}

fn completion_for(job: &Job) -> Option<CompletionEvent> {
    match job.status {
        JobStatus::Succeeded => Some(CompletionEvent::for_outcome(
            Outcome::Succeeded,
            "Deployment completed successfully",
        )),
        JobStatus::Failed => Some(CompletionEvent::for_outcome(
            Outcome::Failed,
            &format!(
                "Deployment failed: {}",
                job.failure_reason.as_deref().unwrap_or("unknown error")
            ),
        )),
        _ => None,
    }
}

/// Completion for a job no running pipeline will ever finish
fn interrupted() -> CompletionEvent {
    CompletionEvent::for_outcome(
        Outcome::Failed,
        "Deployment interrupted: the pipeline is no longer running",
    )
}

pub async fn stream_events(
    _auth: RequireAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let hub = state.orchestrator.hub().clone();
    let replay_capacity = hub.settings().replay_capacity;

    // The record may trail the submission; a tracked id is enough to attach
    let job = if hub.is_tracked(&id) {
        None
    } else {
        Some(find_job(&state, &id).await?)
    };

    let messages: stream::BoxStream<'static, HubMessage> = match job {
        Some(job) if !hub.is_tracked(&job.id) => {
            let store = state.orchestrator.store();
            let total = store.list_events(&job.id, 1, 1).await?.total;
            let history: Vec<LogEvent> = if total == 0 {
                Vec::new()
            } else {
                store.list_events(&job.id, 1, total).await?.events
            };
            let skip = history.len().saturating_sub(replay_capacity);
            let tail = history.into_iter().skip(skip).map(HubMessage::Event);

            let completion = match completion_for(&job) {
                Some(completion) => {
                    debug!(job_id = %job.id, "Serving finished job from history");
                    completion
                }
                None => {
                    warn!(job_id = %job.id, status = %job.status.as_str(), "No pipeline owns this job, reporting it as interrupted");
                    interrupted()
                }
            };
            stream::iter(tail.chain(std::iter::once(HubMessage::Completion(completion)))).boxed()
        }
        Some(job) => live(&hub, &job.id),
        None => live(&hub, &id),
    };

    let shutdown = state.shutdown.clone().cancelled_owned();
    let frames = messages
        .take_until(shutdown)
        .filter_map(|message| async move { to_sse_event(&message).map(Ok) });

    Ok(Sse::new(frames))
}

fn live(hub: &crate::core::BroadcastHub, job_id: &str) -> stream::BoxStream<'static, HubMessage> {
    let (subscription, replay) = hub.subscribe(job_id);
    debug!(%job_id, replayed = replay.len(), "Streaming live events");
    stream::iter(replay.into_iter().map(HubMessage::Event))
        .chain(subscription.into_stream())
        .boxed()
}
