//! Server-Sent Events (SSE) utilities

use crate::events::EventBus;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Stream every event on `event_bus` to an SSE client
///
/// Each event is sent with its type as the SSE event name and its JSON
/// encoding as data. A lagging client skips the events it missed.
pub fn event_bus_sse_stream(
    service_name: &'static str,
    event_bus: &EventBus,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} events", service_name);
    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        // Send initial connected status
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(Event::default().event(event.event_type()).data(data)),
                        Err(e) => warn!("SSE: failed to encode event: {}", e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "SSE: client lagged behind event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
