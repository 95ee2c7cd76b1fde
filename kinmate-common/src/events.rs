//! Event types and event bus
//!
//! Provides the shared event definitions and EventBus for Kinmate services.
//! Events are informational: nothing in the coordination path waits on a
//! subscriber, and emitting with no subscribers is not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kinmate event types
///
/// Serialized with a `type` tag for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompanionEvent {
    /// A final turn was processed and recorded in history
    TurnCompleted {
        user_id: String,
        request_id: String,
        /// 0-based index of the appended round
        round_index: usize,
        timestamp: DateTime<Utc>,
    },

    /// A request id was already claimed; no side effects were applied
    DuplicateSkipped {
        user_id: String,
        request_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A chunk of rounds was summarized and the checkpoint advanced
    ChunkSummarized {
        user_id: String,
        /// First round of the chunk
        start: usize,
        /// New checkpoint (one past the last round of the chunk)
        end: usize,
        timestamp: DateTime<Utc>,
    },

    /// A risk alert was appended to the alert stream
    AlertRaised {
        user_id: String,
        reason: String,
        severity: String,
        timestamp: DateTime<Utc>,
    },

    /// An idle or closed session was finalized and its assistant released
    SessionFinalized {
        user_id: String,
        /// Summary text at the time of finalization
        summary: String,
        timestamp: DateTime<Utc>,
    },
}

impl CompanionEvent {
    /// Event type name (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            CompanionEvent::TurnCompleted { .. } => "TurnCompleted",
            CompanionEvent::DuplicateSkipped { .. } => "DuplicateSkipped",
            CompanionEvent::ChunkSummarized { .. } => "ChunkSummarized",
            CompanionEvent::AlertRaised { .. } => "AlertRaised",
            CompanionEvent::SessionFinalized { .. } => "SessionFinalized",
        }
    }

    /// User the event belongs to
    pub fn user_id(&self) -> &str {
        match self {
            CompanionEvent::TurnCompleted { user_id, .. }
            | CompanionEvent::DuplicateSkipped { user_id, .. }
            | CompanionEvent::ChunkSummarized { user_id, .. }
            | CompanionEvent::AlertRaised { user_id, .. }
            | CompanionEvent::SessionFinalized { user_id, .. } => user_id,
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use kinmate_common::events::{CompanionEvent, EventBus};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(CompanionEvent::DuplicateSkipped {
///     user_id: "grandma".to_string(),
///     request_id: "abc".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CompanionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CompanionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CompanionEvent,
    ) -> Result<usize, broadcast::error::SendError<CompanionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CompanionEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
