//! Exactly-once summarization checkpoint
//!
//! Rounds are summarized in fixed chunks of K. Each attempt peeks the next
//! chunk, runs the summarizer, then commits with a compare-and-set on the
//! checkpoint: the write succeeds only if the checkpoint still equals the
//! chunk start. Summary text is only ever written together with a checkpoint
//! advance, so a successful guard also proves the text read beforehand is
//! current. Concurrent attempts on the same chunk produce exactly one advance;
//! the loser's summary is discarded.

use crate::collaborators::Summarizer;
use crate::history::{Round, RoundHistory};
use kinmate_common::events::{CompanionEvent, EventBus};
use kinmate_common::{keys, Result, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Separator between chunk summaries in the accumulated text
pub const SUMMARY_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Fewer than K unsummarized rounds (or nothing left to flush)
    Insufficient,
    /// Checkpoint moved from `start` to `end`
    Committed { start: usize, end: usize },
    /// Another attempt moved the checkpoint first
    LostRace { start: usize },
}

#[derive(Clone)]
pub struct SummaryCommitter {
    store: Arc<dyn Store>,
    history: RoundHistory,
    summarizer: Arc<dyn Summarizer>,
    chunk_size: usize,
    ttl: Duration,
    events: EventBus,
}

impl SummaryCommitter {
    pub fn new(
        store: Arc<dyn Store>,
        history: RoundHistory,
        summarizer: Arc<dyn Summarizer>,
        chunk_size: usize,
        ttl: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            history,
            summarizer,
            chunk_size,
            ttl,
            events,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Summarize and commit the next full chunk, if there is one
    pub async fn advance(&self, user_id: &str) -> Result<CommitOutcome> {
        match self.history.peek_next_n(user_id, self.chunk_size).await? {
            Some((start, rounds)) => self.summarize_and_commit(user_id, start, &rounds).await,
            None => Ok(CommitOutcome::Insufficient),
        }
    }

    /// Summarize every remaining round as one final chunk
    ///
    /// Used when a session ends with a partial chunk pending.
    pub async fn flush_remaining(&self, user_id: &str) -> Result<CommitOutcome> {
        let (start, rounds) = self.history.peek_remaining(user_id).await?;
        if rounds.is_empty() {
            return Ok(CommitOutcome::Insufficient);
        }
        self.summarize_and_commit(user_id, start, &rounds).await
    }

    async fn summarize_and_commit(
        &self,
        user_id: &str,
        start: usize,
        rounds: &[Round],
    ) -> Result<CommitOutcome> {
        let chunk_summary = self.summarizer.summarize(start, rounds).await?;
        let end = start + rounds.len();

        if !self.commit(user_id, start, end, &chunk_summary).await? {
            debug!(user_id, start, "Summary commit lost to a concurrent attempt");
            return Ok(CommitOutcome::LostRace { start });
        }

        info!(user_id, start, end, "Summary checkpoint advanced");
        self.events.emit_lossy(CompanionEvent::ChunkSummarized {
            user_id: user_id.to_string(),
            start,
            end,
            timestamp: kinmate_common::time::now(),
        });
        Ok(CommitOutcome::Committed { start, end })
    }

    /// Append `chunk_summary` and move the checkpoint `start -> end` atomically
    ///
    /// Returns `false` without writing anything if the checkpoint is no
    /// longer `start`.
    pub async fn commit(
        &self,
        user_id: &str,
        start: usize,
        end: usize,
        chunk_summary: &str,
    ) -> Result<bool> {
        let checkpoint_key = keys::summary_rounds(user_id);
        let text_key = keys::summary_text(user_id);

        let current = self.store.get(&text_key).await?.unwrap_or_default();
        let text = if current.is_empty() {
            chunk_summary.to_string()
        } else {
            format!("{}{}{}", current, SUMMARY_SEPARATOR, chunk_summary)
        };

        // A fresh session has no checkpoint key; "0" is never written.
        let expected = (start > 0).then(|| start.to_string());
        let committed = self
            .store
            .compare_and_set_with(
                &checkpoint_key,
                expected.as_deref(),
                &end.to_string(),
                &[(text_key, text)],
            )
            .await?;

        if committed {
            self.store
                .expire(&keys::session_keys(user_id), self.ttl)
                .await?;
        }
        Ok(committed)
    }
}
