//! Streaming audio segment buffer
//!
//! Non-final transcript fragments of an audio unit accumulate in a store list
//! until the final fragment arrives; the lock owner then drains the list once
//! and merges it with the final fragment.

use kinmate_common::{keys, Result, Store};
use std::sync::Arc;
use tracing::debug;

/// Join partial fragments and the final fragment with single spaces
///
/// Arrival order is preserved and blank pieces are skipped. With no partials
/// the final fragment is returned verbatim.
pub fn merge(partials: &[String], final_fragment: &str) -> String {
    if partials.is_empty() {
        return final_fragment.to_string();
    }
    partials
        .iter()
        .map(|s| s.trim())
        .chain(std::iter::once(final_fragment.trim()))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-audio-unit fragment lists
#[derive(Clone)]
pub struct AudioSegmentBuffer {
    store: Arc<dyn Store>,
}

impl AudioSegmentBuffer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Buffer a non-final fragment
    pub async fn append(&self, user_id: &str, audio_id: &str, fragment: &str) -> Result<()> {
        let len = self
            .store
            .list_push(&keys::audio_segments(user_id, audio_id), fragment)
            .await?;
        debug!(user_id, audio_id, buffered = len, "Buffered partial fragment");
        Ok(())
    }

    /// Read and clear every buffered fragment
    pub async fn drain(&self, user_id: &str, audio_id: &str) -> Result<Vec<String>> {
        self.store
            .list_drain(&keys::audio_segments(user_id, audio_id))
            .await
    }
}
