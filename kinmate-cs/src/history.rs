//! Round history log
//!
//! Per-user append-only list of completed rounds plus the summarization
//! checkpoint (`summary:rounds`, the index of the first unsummarized round)
//! and the accumulated summary text. Rounds before the checkpoint are covered
//! by the summary; rounds from it onward are not.

use kinmate_common::{keys, Error, Result, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One completed exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    /// User utterance (merged transcript for audio units)
    pub input: String,
    /// Assistant reply
    pub output: String,
    #[serde(rename = "rid")]
    pub request_id: String,
}

/// Summary text and checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryState {
    pub text: String,
    /// Rounds covered by `text`
    pub rounds: usize,
}

#[derive(Clone)]
pub struct RoundHistory {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl RoundHistory {
    /// `ttl` is applied to every session key on each append
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Append a round and refresh the session TTL; returns its index
    pub async fn append(&self, user_id: &str, round: &Round) -> Result<usize> {
        let encoded = serde_json::to_string(round)?;
        let len = self.store.list_push(&keys::history(user_id), &encoded).await?;
        self.store
            .set(&keys::session_state(user_id), "ACTIVE", Some(self.ttl))
            .await?;
        self.store
            .expire(&keys::session_keys(user_id), self.ttl)
            .await?;
        Ok(len - 1)
    }

    pub async fn len(&self, user_id: &str) -> Result<usize> {
        self.store.list_len(&keys::history(user_id)).await
    }

    /// Every recorded round, oldest first
    pub async fn all(&self, user_id: &str) -> Result<Vec<Round>> {
        self.range(user_id, 0, usize::MAX).await
    }

    /// Rounds `[start, end)`
    pub async fn range(&self, user_id: &str, start: usize, end: usize) -> Result<Vec<Round>> {
        self.store
            .list_range(&keys::history(user_id), start, end)
            .await?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }

    /// Index of the first unsummarized round
    pub async fn checkpoint(&self, user_id: &str) -> Result<usize> {
        match self.store.get(&keys::summary_rounds(user_id)).await? {
            None => Ok(0),
            Some(raw) => raw.trim().parse().map_err(|_| {
                Error::Internal(format!("Corrupt summary checkpoint for {}: {:?}", user_id, raw))
            }),
        }
    }

    pub async fn summary(&self, user_id: &str) -> Result<SummaryState> {
        let text = self
            .store
            .get(&keys::summary_text(user_id))
            .await?
            .unwrap_or_default();
        let rounds = self.checkpoint(user_id).await?;
        Ok(SummaryState { text, rounds })
    }

    /// The next `n` unsummarized rounds with the index of the first
    ///
    /// `None` while fewer than `n` rounds are pending. Read-only; the
    /// checkpoint only moves through a summary commit.
    pub async fn peek_next_n(&self, user_id: &str, n: usize) -> Result<Option<(usize, Vec<Round>)>> {
        if n == 0 {
            return Err(Error::InvalidInput("chunk size must be at least 1".to_string()));
        }
        let start = self.checkpoint(user_id).await?;
        let len = self.len(user_id).await?;
        if len < start + n {
            return Ok(None);
        }
        let rounds = self.range(user_id, start, start + n).await?;
        Ok(Some((start, rounds)))
    }

    /// Every unsummarized round with the index of the first (possibly empty)
    pub async fn peek_remaining(&self, user_id: &str) -> Result<(usize, Vec<Round>)> {
        let start = self.checkpoint(user_id).await?;
        let rounds = self.range(user_id, start, usize::MAX).await?;
        Ok((start, rounds))
    }

    /// The last `k` unsummarized rounds
    pub async fn unsummarized_tail(&self, user_id: &str, k: usize) -> Result<Vec<Round>> {
        let start = self.checkpoint(user_id).await?;
        let len = self.len(user_id).await?;
        let from = start.max(len.saturating_sub(k));
        self.range(user_id, from, len).await
    }
}
