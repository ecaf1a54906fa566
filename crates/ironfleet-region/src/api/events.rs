//! Lifecycle Event Stream
//!
//! `GET /events` streams every lifecycle event as server-sent events, named
//! after the event type. `?machine=<id>` narrows the stream to one machine.
//! A subscriber that falls behind receives a `lagged` event with the number
//! of events it missed.

use super::AppState;
use crate::lifecycle::LifecycleEvent;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use ironfleet_core::ids::MachineId;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    pub machine: Option<MachineId>,
}

#[tracing::instrument(skip(state))]
pub async fn stream_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.engine.subscribe();
    let machine = filter.machine;

    let events = stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if machine.is_some_and(|m| m != event.machine()) {
                        continue;
                    }
                    return Some((Ok(sse_event(&event)), receiver));
                }
                Err(RecvError::Lagged(missed)) => {
                    let event = Event::default().event("lagged").data(missed.to_string());
                    return Some((Ok(event), receiver));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn sse_event(event: &LifecycleEvent) -> Event {
    match serde_json::to_value(event) {
        Ok(value) => {
            let name = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("lifecycle")
                .to_string();
            Event::default().event(name).data(value.to_string())
        }
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}
