//! Collaborator fakes

use kinmate_common::{Error, Result};
use kinmate_cs::collaborators::{Assistant, AssistantFactory, Summarizer};
use kinmate_cs::history::Round;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    inputs: Mutex<Vec<String>>,
    created: AtomicUsize,
    delay: Duration,
    fail: bool,
}

/// Assistant factory whose assistants record every input
///
/// Replies are `"reply to <input>"`.
#[derive(Clone, Default)]
pub struct RecordingAssistants {
    recorder: Arc<Recorder>,
}

impl RecordingAssistants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assistants that take `delay` to answer
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            recorder: Arc::new(Recorder {
                delay,
                ..Default::default()
            }),
        }
    }

    /// Assistants that always fail
    pub fn failing() -> Self {
        Self {
            recorder: Arc::new(Recorder {
                fail: true,
                ..Default::default()
            }),
        }
    }

    pub fn inputs(&self) -> Vec<String> {
        self.recorder.inputs.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.recorder.inputs.lock().unwrap().len()
    }

    pub fn created(&self) -> usize {
        self.recorder.created.load(Ordering::SeqCst)
    }
}

struct RecordingAssistant {
    recorder: Arc<Recorder>,
}

#[async_trait::async_trait]
impl Assistant for RecordingAssistant {
    async fn respond(&self, _context: &str, text: &str) -> Result<String> {
        self.recorder.inputs.lock().unwrap().push(text.to_string());
        if !self.recorder.delay.is_zero() {
            tokio::time::sleep(self.recorder.delay).await;
        }
        if self.recorder.fail {
            return Err(Error::Collaborator("assistant offline".to_string()));
        }
        Ok(format!("reply to {}", text))
    }
}

#[async_trait::async_trait]
impl AssistantFactory for RecordingAssistants {
    async fn create(&self, _user_id: &str) -> Result<Arc<dyn Assistant>> {
        self.recorder.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingAssistant {
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

/// Summarizer producing `"summary <start>..<end>"`
#[derive(Default)]
pub struct CountingSummarizer {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingSummarizer {
    /// Summarizer that takes `delay` per chunk
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, start: usize, rounds: &[Round]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!("summary {}..{}", start, start + rounds.len()))
    }
}
