//! Request deduplication
//!
//! Protects the round history against client retries and at-least-once
//! delivery: a `(user_id, request_id)` pair is claimed at most once within the
//! claim TTL. After the TTL the id may be reused.

use kinmate_common::{keys, Result, Store};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Derive a request id from the user, the content and a time bucket
///
/// Identical content from the same user inside one `window_ms` bucket maps to
/// the same id.
pub fn make_request_id(user_id: &str, content: &str, now_ms: i64, window_ms: u64) -> String {
    let bucket = now_ms.max(0) as u64 / window_ms.max(1);
    let digest = Sha256::digest(format!("{}|{}|{}", user_id, content, bucket).as_bytes());
    format!("{:x}", digest)
}

/// Claims request ids in the shared store
#[derive(Clone)]
pub struct RequestDeduplicator {
    store: Arc<dyn Store>,
    ttl: Duration,
    window_ms: u64,
}

impl RequestDeduplicator {
    pub fn new(store: Arc<dyn Store>, ttl: Duration, window_ms: u64) -> Self {
        Self {
            store,
            ttl,
            window_ms,
        }
    }

    /// Request id for content submitted now
    pub fn request_id(&self, user_id: &str, content: &str) -> String {
        make_request_id(user_id, content, kinmate_common::time::now_millis(), self.window_ms)
    }

    /// Register `request_id`; `false` means it was already claimed
    pub async fn claim(&self, user_id: &str, request_id: &str) -> Result<bool> {
        let claimed = self
            .store
            .compare_and_set(&keys::processed(user_id, request_id), None, "1", Some(self.ttl))
            .await?;
        debug!(user_id, request_id, claimed, "Request claim");
        Ok(claimed)
    }

    /// Drop a claim whose round could not be recorded
    pub async fn release(&self, user_id: &str, request_id: &str) -> Result<()> {
        self.store
            .delete(&[keys::processed(user_id, request_id)])
            .await?;
        Ok(())
    }
}
