//! Turn pipeline
//!
//! Routes one inbound turn through the coordination components:
//!
//! 1. Non-final fragment: buffered, acknowledged, no collaborator calls.
//! 2. Final fragment of an audio unit: the unit lock picks a single owner;
//!    everyone else gets the owner's cached reply or a "still processing"
//!    placeholder.
//! 3. The owner (or a plain text turn) drains and merges the fragments, runs
//!    the safety classifier and, unless blocked, the user's assistant. The
//!    round is then recorded once per request id and the summary checkpoint
//!    is given a chance to advance.

use crate::alerts::{AlertEmitter, Severity};
use crate::audio_buffer::{merge, AudioSegmentBuffer};
use crate::audio_lock::{Acquire, AudioUnitLock};
use crate::checkpoint::{CommitOutcome, SummaryCommitter};
use crate::collaborators::{ContextRetriever, SafetyClassifier, Verdict};
use crate::dedup::RequestDeduplicator;
use crate::history::{Round, RoundHistory};
use crate::registry::AssistantRegistry;
use kinmate_common::events::{CompanionEvent, EventBus};
use kinmate_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Acknowledgement for a buffered partial fragment
pub const PARTIAL_ACK: &str = "Voice segment received.";
/// Reply while another request owns the audio unit
pub const PROCESSING_REPLY: &str = "Still working on your last message, please wait a moment.";
/// Cached for an audio unit whose processing failed
pub const FAILURE_REPLY: &str = "Sorry, I could not answer just now. Please try again in a moment.";
const BLOCKED_PREFIX: &str = "System intercepted: ";

/// One inbound turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: String,
    pub text: String,
    /// Groups streaming fragments of one utterance
    #[serde(default)]
    pub audio_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_final: bool,
    /// Client-supplied idempotency key; derived from the content when absent
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TurnRequest {
    /// Complete text turn
    pub fn text(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            audio_id: None,
            is_final: true,
            request_id: None,
        }
    }

    /// Non-final fragment of an audio unit
    pub fn partial(user_id: impl Into<String>, audio_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            audio_id: Some(audio_id.into()),
            is_final: false,
            ..Self::text(user_id, text)
        }
    }

    /// Final fragment of an audio unit
    pub fn final_fragment(
        user_id: impl Into<String>,
        audio_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            audio_id: Some(audio_id.into()),
            ..Self::text(user_id, text)
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Fragment buffered
    Partial,
    /// Assistant replied
    Completed,
    /// Safety classifier intercepted the input
    Blocked,
    /// Reply published earlier by the unit's owner
    Cached,
    /// Another request is still processing the unit
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The request id had already been recorded; history was not touched
    #[serde(default)]
    pub duplicate: bool,
}

impl TurnOutcome {
    pub fn new(status: TurnStatus, reply: impl Into<String>) -> Self {
        Self {
            status,
            reply: reply.into(),
            request_id: None,
            duplicate: false,
        }
    }
}

pub struct TurnPipeline {
    pub(crate) dedup: RequestDeduplicator,
    pub(crate) buffer: AudioSegmentBuffer,
    pub(crate) lock: AudioUnitLock,
    pub(crate) history: RoundHistory,
    pub(crate) committer: SummaryCommitter,
    pub(crate) alerts: AlertEmitter,
    pub(crate) classifier: Arc<dyn SafetyClassifier>,
    pub(crate) registry: Arc<AssistantRegistry>,
    pub(crate) context: Arc<dyn ContextRetriever>,
    pub(crate) events: EventBus,
}

impl TurnPipeline {
    pub async fn handle(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(Error::InvalidInput("user_id must not be empty".to_string()));
        }

        match (request.audio_id.as_deref(), request.is_final) {
            (Some(audio_id), false) => {
                self.buffer.append(user_id, audio_id, &request.text).await?;
                Ok(TurnOutcome::new(TurnStatus::Partial, PARTIAL_ACK))
            }
            (None, false) => Err(Error::InvalidInput(
                "non-final fragments require an audio_id".to_string(),
            )),
            (None, true) => {
                if request.text.trim().is_empty() {
                    return Err(Error::InvalidInput("text must not be empty".to_string()));
                }
                self.respond(user_id, &request.text, request.request_id.clone())
                    .await
            }
            (Some(audio_id), true) => self.handle_final_unit(user_id, audio_id, &request).await,
        }
    }

    async fn handle_final_unit(
        &self,
        user_id: &str,
        audio_id: &str,
        request: &TurnRequest,
    ) -> Result<TurnOutcome> {
        // Emptiness is judged by the owner after draining; a retried empty
        // final must still see the owner's reply
        let guard = match self.lock.acquire(user_id, audio_id).await? {
            Acquire::Owned(guard) => guard,
            Acquire::AlreadyOwned(state) => {
                return Ok(match self.lock.cached_result(user_id, audio_id).await? {
                    Some(reply) => TurnOutcome::new(TurnStatus::Cached, reply),
                    None => {
                        debug!(user_id, audio_id, ?state, "Audio unit has no result yet");
                        TurnOutcome::new(TurnStatus::Processing, PROCESSING_REPLY)
                    }
                });
            }
        };

        match self.process_unit(user_id, audio_id, request).await {
            Ok(outcome) => {
                guard.finish(&outcome.reply).await?;
                Ok(outcome)
            }
            Err(e) => {
                warn!(user_id, audio_id, "Audio unit failed: {}", e);
                if let Err(cache_err) = guard.finish(FAILURE_REPLY).await {
                    warn!(user_id, audio_id, "Failed to cache failure reply: {}", cache_err);
                }
                Err(e)
            }
        }
    }

    async fn process_unit(
        &self,
        user_id: &str,
        audio_id: &str,
        request: &TurnRequest,
    ) -> Result<TurnOutcome> {
        let partials = self.buffer.drain(user_id, audio_id).await?;
        let merged = merge(&partials, &request.text);
        if merged.trim().is_empty() {
            return Err(Error::InvalidInput("audio unit transcript is empty".to_string()));
        }
        debug!(user_id, audio_id, partials = partials.len(), "Merged audio unit");
        self.respond(user_id, &merged, request.request_id.clone())
            .await
    }

    async fn respond(
        &self,
        user_id: &str,
        text: &str,
        request_id: Option<String>,
    ) -> Result<TurnOutcome> {
        if let Verdict::Block(reason) = self.classifier.classify(text).await? {
            warn!(user_id, reason = %reason, "Input intercepted by safety classifier");
            if self.alerts.should_alert(&reason) {
                self.alerts.emit(user_id, &reason, Severity::High).await;
            }
            return Ok(TurnOutcome::new(
                TurnStatus::Blocked,
                format!("{}{}", BLOCKED_PREFIX, reason),
            ));
        }

        let assistant = self.registry.get_or_create(user_id).await?;
        let context = self.context.context(user_id).await?;
        let reply = assistant.respond(&context, text).await?;

        let request_id = request_id
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| self.dedup.request_id(user_id, text));
        let recorded = self.record_round(user_id, text, &reply, &request_id).await?;

        Ok(TurnOutcome {
            status: TurnStatus::Completed,
            reply,
            request_id: Some(request_id),
            duplicate: !recorded,
        })
    }

    /// Record a round once per request id, then try to advance the summary
    ///
    /// Returns `false` when the request id was already recorded.
    pub async fn record_round(
        &self,
        user_id: &str,
        input: &str,
        output: &str,
        request_id: &str,
    ) -> Result<bool> {
        if !self.dedup.claim(user_id, request_id).await? {
            info!(user_id, request_id, "Duplicate request, round not recorded");
            self.events.emit_lossy(CompanionEvent::DuplicateSkipped {
                user_id: user_id.to_string(),
                request_id: request_id.to_string(),
                timestamp: kinmate_common::time::now(),
            });
            return Ok(false);
        }

        let round = Round {
            input: input.to_string(),
            output: output.to_string(),
            request_id: request_id.to_string(),
        };
        let round_index = match self.history.append(user_id, &round).await {
            Ok(index) => index,
            Err(e) => {
                if let Err(release_err) = self.dedup.release(user_id, request_id).await {
                    warn!(user_id, request_id, "Failed to release request claim: {}", release_err);
                }
                return Err(e);
            }
        };
        debug!(user_id, request_id, round_index, "Round recorded");
        self.events.emit_lossy(CompanionEvent::TurnCompleted {
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            round_index,
            timestamp: kinmate_common::time::now(),
        });

        match self.committer.advance(user_id).await {
            Ok(CommitOutcome::LostRace { start }) => {
                debug!(user_id, start, "Chunk already summarized by another request")
            }
            Ok(_) => {}
            Err(e) => warn!(user_id, "Summarization deferred: {}", e),
        }
        Ok(true)
    }
}
