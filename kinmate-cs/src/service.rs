//! Companion service wiring
//!
//! Builds every coordination component over one shared store and event bus.

use crate::alerts::AlertEmitter;
use crate::audio_buffer::AudioSegmentBuffer;
use crate::audio_lock::AudioUnitLock;
use crate::checkpoint::SummaryCommitter;
use crate::collaborators::{Collaborators, ContextRetriever, SessionFinalizer};
use crate::context::HistoryContext;
use crate::dedup::RequestDeduplicator;
use crate::finalizer::SummarizingFinalizer;
use crate::history::RoundHistory;
use crate::pipeline::{TurnOutcome, TurnPipeline, TurnRequest};
use crate::registry::AssistantRegistry;
use crate::session::SessionManager;
use kinmate_common::config::ServiceConfig;
use kinmate_common::events::EventBus;
use kinmate_common::{Error, Result, Store};
use std::sync::Arc;

pub struct CompanionService {
    config: ServiceConfig,
    pipeline: TurnPipeline,
    sessions: SessionManager,
    events: EventBus,
}

impl CompanionService {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn Store>,
        events: EventBus,
        collaborators: Collaborators,
    ) -> Self {
        let ttl = config.request_ttl();
        let history = RoundHistory::new(Arc::clone(&store), ttl);
        let committer = SummaryCommitter::new(
            Arc::clone(&store),
            history.clone(),
            collaborators.summarizer,
            config.summary_chunk_size,
            ttl,
            events.clone(),
        );
        let registry = Arc::new(AssistantRegistry::new(collaborators.assistants));

        let context: Arc<dyn ContextRetriever> = collaborators
            .context
            .unwrap_or_else(|| Arc::new(HistoryContext::new(history.clone(), config.context_turns)));
        let finalizer: Arc<dyn SessionFinalizer> = collaborators.finalizer.unwrap_or_else(|| {
            Arc::new(SummarizingFinalizer::new(
                Arc::clone(&store),
                history.clone(),
                committer.clone(),
                config.purge_on_finalize,
            ))
        });

        let sessions = SessionManager::new(
            Arc::clone(&registry),
            finalizer,
            events.clone(),
            config.idle_timeout(),
            config.watchdog_poll(),
        );

        let pipeline = TurnPipeline {
            dedup: RequestDeduplicator::new(Arc::clone(&store), ttl, config.dedup_window_ms),
            buffer: AudioSegmentBuffer::new(Arc::clone(&store)),
            lock: AudioUnitLock::new(Arc::clone(&store), ttl),
            history,
            committer,
            alerts: AlertEmitter::new(
                Arc::clone(&store),
                config.alert_stream_key.clone(),
                &config.self_harm_keywords,
                events.clone(),
            ),
            classifier: collaborators.classifier,
            registry,
            context,
            events: events.clone(),
        };

        Self {
            config,
            pipeline,
            sessions,
            events,
        }
    }

    /// Handle one turn, recording activity on the user's session
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(Error::InvalidInput("user_id must not be empty".to_string()));
        }
        self.sessions.touch(user_id).await;
        self.pipeline.handle(request).await
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn history(&self) -> &RoundHistory {
        &self.pipeline.history
    }

    pub fn alerts(&self) -> &AlertEmitter {
        &self.pipeline.alerts
    }

    pub fn registry(&self) -> &AssistantRegistry {
        &self.pipeline.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Finalize every open session
    pub async fn shutdown(&self) -> usize {
        self.sessions.close_all().await
    }
}
