//! Session finalization: flush the pending summary, optionally purge

use crate::checkpoint::{CommitOutcome, SummaryCommitter};
use crate::collaborators::SessionFinalizer;
use crate::history::RoundHistory;
use kinmate_common::{keys, Result, Store};
use std::sync::Arc;
use tracing::info;

pub struct SummarizingFinalizer {
    store: Arc<dyn Store>,
    history: RoundHistory,
    committer: SummaryCommitter,
    purge: bool,
}

impl SummarizingFinalizer {
    /// With `purge`, the session keys are deleted once the summary is flushed
    pub fn new(
        store: Arc<dyn Store>,
        history: RoundHistory,
        committer: SummaryCommitter,
        purge: bool,
    ) -> Self {
        Self {
            store,
            history,
            committer,
            purge,
        }
    }
}

#[async_trait::async_trait]
impl SessionFinalizer for SummarizingFinalizer {
    async fn finalize(&self, user_id: &str) -> Result<String> {
        // Full chunks first so chunk boundaries match the live path
        while let CommitOutcome::Committed { .. } = self.committer.advance(user_id).await? {}
        self.committer.flush_remaining(user_id).await?;

        let summary = self.history.summary(user_id).await?;
        info!(user_id, rounds = summary.rounds, "Session summary flushed");

        if self.purge {
            let removed = self.store.delete(&keys::session_keys(user_id)).await?;
            info!(user_id, removed, "Purged session keys");
        }
        Ok(summary.text)
    }
}
