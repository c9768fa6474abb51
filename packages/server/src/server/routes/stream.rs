//! SSE endpoint for a job's live log and status stream.
//!
//! GET /jobs/{id}/stream
//!
//! Replays any buffered output before switching to live delivery, and keeps
//! the connection open with periodic keepalive comments until the job
//! reaches a terminal status.

use std::collections::VecDeque;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};

use crate::server::app::AppState;
use crate::stream_bus::{StreamMessage, StreamMessageType, Subscription};

fn to_event(msg: &StreamMessage) -> Event {
    if msg.kind == StreamMessageType::Keepalive {
        Event::default().comment("keepalive")
    } else {
        Event::default()
            .event(msg.kind.as_str())
            .data(msg.content.clone())
    }
}

enum Phase {
    Pending(VecDeque<Event>, Option<Subscription>),
    Live(Subscription),
}

pub async fn stream_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let job = state
        .instance
        .store
        .find_by_id(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let initial_status = job.status;
    let mut pending = VecDeque::new();
    pending.push_back(Event::default().event("status").data(initial_status.as_str()));

    let subscription = if initial_status.is_terminal() {
        if let Some(log) = job.output_log {
            pending.push_back(Event::default().event("complete").data(log));
        }
        None
    } else {
        Some(state.instance.stream_bus.subscribe(id, 0).await)
    };

    let event_stream = stream::unfold(Phase::Pending(pending, subscription), |phase| async move {
        match phase {
            Phase::Pending(mut queue, sub) => {
                if let Some(event) = queue.pop_front() {
                    Some((Ok(event), Phase::Pending(queue, sub)))
                } else {
                    match sub {
                        Some(mut s) => s.next().await.map(|msg| (Ok(to_event(&msg)), Phase::Live(s))),
                        None => None,
                    }
                }
            }
            Phase::Live(mut s) => s
                .next()
                .await
                .map(|msg| (Ok(to_event(&msg)), Phase::Live(s))),
        }
    });

    Ok(Sse::new(event_stream).keep_alive(KeepAlive::default()))
}
