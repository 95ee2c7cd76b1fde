//! Test Helper Utilities
//!
//! Shared fakes and service builders for kinmate-cs integration tests

#![allow(dead_code)]

pub mod fakes;

pub use fakes::{CountingSummarizer, RecordingAssistants};

use kinmate_common::config::ServiceConfig;
use kinmate_common::events::EventBus;
use kinmate_common::store::MemoryStore;
use kinmate_common::Store;
use kinmate_cs::collaborators::Collaborators;
use kinmate_cs::keyword_guard::KeywordGuard;
use kinmate_cs::CompanionService;
use std::sync::Arc;

/// A service wired to fakes, with handles to inspect them
pub struct Harness {
    pub service: Arc<CompanionService>,
    pub store: Arc<dyn Store>,
    pub assistants: RecordingAssistants,
    pub summarizer: Arc<CountingSummarizer>,
    pub events: EventBus,
}

/// Defaults with a chunk size of 5
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        summary_chunk_size: 5,
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config(), Arc::new(MemoryStore::new()), RecordingAssistants::new())
}

pub fn harness_with(
    config: ServiceConfig,
    store: Arc<dyn Store>,
    assistants: RecordingAssistants,
) -> Harness {
    harness_with_summarizer(config, store, assistants, CountingSummarizer::default())
}

pub fn harness_with_summarizer(
    config: ServiceConfig,
    store: Arc<dyn Store>,
    assistants: RecordingAssistants,
    summarizer: CountingSummarizer,
) -> Harness {
    let summarizer = Arc::new(summarizer);
    let events = EventBus::new(256);
    let collaborators = Collaborators::new(
        Arc::new(KeywordGuard::default()),
        Arc::new(assistants.clone()),
        summarizer.clone(),
    );
    let service = Arc::new(CompanionService::new(
        config,
        Arc::clone(&store),
        events.clone(),
        collaborators,
    ));
    Harness {
        service,
        store,
        assistants,
        summarizer,
        events,
    }
}
