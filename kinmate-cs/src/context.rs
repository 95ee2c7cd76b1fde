//! Assistant context assembled from the round history

use crate::collaborators::ContextRetriever;
use crate::history::RoundHistory;
use kinmate_common::Result;

/// Summary text plus the most recent unsummarized rounds
pub struct HistoryContext {
    history: RoundHistory,
    recent_turns: usize,
}

impl HistoryContext {
    pub fn new(history: RoundHistory, recent_turns: usize) -> Self {
        Self {
            history,
            recent_turns,
        }
    }
}

#[async_trait::async_trait]
impl ContextRetriever for HistoryContext {
    async fn context(&self, user_id: &str) -> Result<String> {
        let summary = self.history.summary(user_id).await?;
        let recent = self
            .history
            .unsummarized_tail(user_id, self.recent_turns)
            .await?;

        let mut context = String::new();
        if !summary.text.is_empty() {
            context.push_str("Conversation summary:\n");
            context.push_str(&summary.text);
            context.push_str("\n\n");
        }
        if !recent.is_empty() {
            context.push_str("Recent conversation:\n");
            for round in &recent {
                context.push_str(&format!("User: {}\nCompanion: {}\n", round.input, round.output));
            }
        }
        Ok(context.trim_end().to_string())
    }
}
