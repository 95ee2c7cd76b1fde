//! External collaborator contracts
//!
//! The coordination core treats classification, response generation, context
//! retrieval, summarization and session finalization as external services.
//! Each is a trait object so deployments (and tests) can swap implementations.

use crate::history::Round;
use kinmate_common::Result;
use std::fmt;
use std::sync::Arc;

/// Safety classifier verdict (`"OK"` or `"BLOCK: <reason>"` on the wire)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(String),
}

impl Verdict {
    /// Parse a raw classifier answer
    ///
    /// Only an explicit `BLOCK:` prefix blocks; anything else is allowed.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().strip_prefix("BLOCK:") {
            Some(reason) => Verdict::Block(reason.trim().to_string()),
            None => Verdict::Allow,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "OK"),
            Verdict::Block(reason) => write!(f, "BLOCK: {}", reason),
        }
    }
}

/// Guardrail step run before any assistant call
#[async_trait::async_trait]
pub trait SafetyClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Verdict>;
}

/// Per-user conversational assistant handle
#[async_trait::async_trait]
pub trait Assistant: Send + Sync {
    /// Produce a reply to `text` given the assembled `context`
    async fn respond(&self, context: &str, text: &str) -> Result<String>;
}

/// Builds the (expensive) assistant handle for a user
#[async_trait::async_trait]
pub trait AssistantFactory: Send + Sync {
    async fn create(&self, user_id: &str) -> Result<Arc<dyn Assistant>>;
}

/// Assembles grounding context for the assistant
#[async_trait::async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn context(&self, user_id: &str) -> Result<String>;
}

/// Renders a contiguous chunk of rounds into summary text
///
/// May be invoked for a chunk whose commit is later lost to a concurrent
/// attempt; implementations must tolerate that.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    /// `start` is the history index of `rounds[0]`
    async fn summarize(&self, start: usize, rounds: &[Round]) -> Result<String>;
}

/// Flush/close hook run when a session ends
#[async_trait::async_trait]
pub trait SessionFinalizer: Send + Sync {
    /// Returns the summary text as of finalization (may be empty)
    async fn finalize(&self, user_id: &str) -> Result<String>;
}

/// The collaborator set a service is built with
///
/// Context retrieval and finalization default to the history-backed
/// implementations when not supplied.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn SafetyClassifier>,
    pub assistants: Arc<dyn AssistantFactory>,
    pub summarizer: Arc<dyn Summarizer>,
    pub context: Option<Arc<dyn ContextRetriever>>,
    pub finalizer: Option<Arc<dyn SessionFinalizer>>,
}

impl Collaborators {
    pub fn new(
        classifier: Arc<dyn SafetyClassifier>,
        assistants: Arc<dyn AssistantFactory>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            classifier,
            assistants,
            summarizer,
            context: None,
            finalizer: None,
        }
    }

    pub fn with_context(mut self, context: Arc<dyn ContextRetriever>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn SessionFinalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }
}
