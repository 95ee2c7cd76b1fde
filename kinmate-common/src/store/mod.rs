//! Shared key/value, list and stream store
//!
//! Every cross-caller exclusivity decision in Kinmate is a conditional write
//! against this store: handlers may run as tasks, processes or separate hosts,
//! and the store is the single arbiter of truth. A backend that cannot perform
//! `compare_and_set` atomically breaks the exactly-once guarantees of the audio
//! unit lock and the summarization checkpoint.
//!
//! # Backends
//! - [`MemoryStore`]: one process, tokio mutex around a hash map
//! - [`SqliteStore`]: SQLite file shared by any number of processes

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One entry of an append-only stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Entry id, `"{millis}-{sequence}"`
    pub id: String,
    /// Field/value pairs in insertion order
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Look up a field value by name
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Contract over the shared store
///
/// Absent and expired keys are indistinguishable to callers.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally write a value, replacing any previous TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically write `value` iff the current value equals `expected`
    ///
    /// `expected = None` matches only an absent (or expired) key. Returns
    /// whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Guarded multi-write
    ///
    /// Same guard as [`Store::compare_and_set`] on `key`; when it matches,
    /// `key` is set to `value` and every pair in `extra` is written in the
    /// same atomic step. Keys written here carry no TTL.
    async fn compare_and_set_with(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        extra: &[(String, String)],
    ) -> Result<bool>;

    /// Delete values and lists; returns how many keys existed
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Refresh the TTL of keys that currently exist
    async fn expire(&self, keys: &[String], ttl: Duration) -> Result<()>;

    /// Append to a list, returning the new length
    async fn list_push(&self, key: &str, value: &str) -> Result<usize>;

    /// Length of a list (0 when absent)
    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Elements `[start, end)` of a list, clamped to its length
    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<String>>;

    /// Atomically read the whole list and remove it
    async fn list_drain(&self, key: &str) -> Result<Vec<String>>;

    /// Append an entry to a stream, returning its id
    async fn stream_append(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    /// All entries of a stream, oldest first
    async fn stream_range(&self, stream: &str) -> Result<Vec<StreamEntry>>;
}

/// Open a store from its connection URL
///
/// - `memory://` → [`MemoryStore`]
/// - `sqlite://<path>` → [`SqliteStore`] (file created if missing)
pub async fn connect(url: &str) -> Result<Arc<dyn Store>> {
    if url == "memory://" || url == "memory" {
        tracing::info!("Using in-process memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(Error::Config("sqlite store URL has no path".to_string()));
        }
        let store = SqliteStore::open(std::path::Path::new(path)).await?;
        return Ok(Arc::new(store));
    }

    Err(Error::Config(format!("Unsupported store URL: {}", url)))
}
