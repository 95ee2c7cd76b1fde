//! kinmate-cs library interface
//!
//! Coordination layer of the elder companion service: request dedup, audio
//! unit locking, round history with exactly-once summarization checkpoints,
//! idle session finalization and risk alerts.

pub mod alerts;
pub mod api;
pub mod audio_buffer;
pub mod audio_lock;
pub mod checkpoint;
pub mod collaborators;
pub mod context;
pub mod dedup;
pub mod error;
pub mod finalizer;
pub mod history;
pub mod keyword_guard;
pub mod llm_client;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod session;
pub mod watchdog;

pub use crate::error::{ApiError, ApiResult};
pub use crate::pipeline::{TurnOutcome, TurnRequest, TurnStatus};
pub use crate::service::CompanionService;

use axum::Router;
use chrono::{DateTime, Utc};
use kinmate_common::events::EventBus;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CompanionService>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: Arc<CompanionService>) -> Self {
        let event_bus = service.events().clone();
        Self {
            service,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::turn_routes())
        .merge(api::user_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .with_state(state)
}
