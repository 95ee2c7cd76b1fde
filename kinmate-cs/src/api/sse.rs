//! Server-Sent Events stream of companion events

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /events
///
/// Streams TurnCompleted, DuplicateSkipped, ChunkSummarized, AlertRaised and
/// SessionFinalized events.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    kinmate_common::sse::event_bus_sse_stream("kinmate-cs", &state.event_bus)
}
