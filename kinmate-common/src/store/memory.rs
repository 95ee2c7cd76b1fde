//! In-process store backend
//!
//! A single tokio mutex serializes every operation, which makes each call
//! atomic with respect to every other call. Expiry is lazy and measured on
//! `tokio::time::Instant`, so tests can drive it with paused time.

use super::{Store, StreamEntry};
use crate::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    streams: HashMap<String, Vec<StreamEntry>>,
    last_stream_millis: i64,
    stream_seq: u64,
}

impl Inner {
    /// Live entry for `key`, dropping it first if expired
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn text(&mut self, key: &str) -> Option<String> {
        match self.live(key) {
            Some(Entry { value: Value::Text(s), .. }) => Some(s.clone()),
            _ => None,
        }
    }

    fn put_text(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }
}

/// Store kept entirely in this process
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().await.text(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner.lock().await.put_text(key, value, ttl);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.text(key).as_deref() != expected {
            return Ok(false);
        }
        inner.put_text(key, value, ttl);
        Ok(true)
    }

    async fn compare_and_set_with(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        extra: &[(String, String)],
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.text(key).as_deref() != expected {
            return Ok(false);
        }
        inner.put_text(key, value, None);
        for (k, v) in extra {
            inner.put_text(k, v, None);
        }
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        for key in keys {
            if inner.live(key).is_some() {
                inner.entries.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn expire(&self, keys: &[String], ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let at = Instant::now() + ttl;
        for key in keys {
            if let Some(entry) = inner.live(key) {
                entry.expires_at = Some(at);
            }
        }
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            Some(Entry { value: Value::List(items), .. }) => {
                items.push(value.to_string());
                Ok(items.len())
            }
            _ => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(vec![value.to_string()]),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.live(key) {
            Some(Entry { value: Value::List(items), .. }) => items.len(),
            _ => 0,
        })
    }

    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.live(key) {
            Some(Entry { value: Value::List(items), .. }) => {
                let end = end.min(items.len());
                if start >= end {
                    Vec::new()
                } else {
                    items[start..end].to_vec()
                }
            }
            _ => Vec::new(),
        })
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let is_list = matches!(
            inner.live(key),
            Some(Entry { value: Value::List(_), .. })
        );
        if !is_list {
            return Ok(Vec::new());
        }
        match inner.entries.remove(key) {
            Some(Entry { value: Value::List(items), .. }) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    async fn stream_append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let millis = crate::time::now_millis().max(inner.last_stream_millis);
        if millis == inner.last_stream_millis {
            inner.stream_seq += 1;
        } else {
            inner.last_stream_millis = millis;
            inner.stream_seq = 0;
        }
        let id = format!("{}-{}", millis, inner.stream_seq);
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(StreamEntry {
                id: id.clone(),
                fields: fields.to_vec(),
            });
        Ok(id)
    }

    async fn stream_range(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(stream).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_absent_key_matches_none_expectation() {
        let store = MemoryStore::new();
        assert!(store.compare_and_set("k", None, "a", None).await.unwrap());
        assert!(!store.compare_and_set("k", None, "b", None).await.unwrap());
        assert!(store.compare_and_set("k", Some("a"), "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_claim_can_be_reclaimed() {
        let store = MemoryStore::new();
        let ttl = Some(Duration::from_secs(10));
        assert!(store.compare_and_set("claim", None, "1", ttl).await.unwrap());
        assert!(!store.compare_and_set("claim", None, "1", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("claim").await.unwrap(), None);
        assert!(store.compare_and_set("claim", None, "1", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_refreshes_lists() {
        let store = MemoryStore::new();
        store.list_push("l", "x").await.unwrap();
        store.expire(&["l".to_string()], Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.list_len("l").await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.list_len("l").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.compare_and_set("lock", None, "PROCESSING", None).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_stream_ids_are_unique_and_ordered() {
        let store = MemoryStore::new();
        let a = store.stream_append("s", &[]).await.unwrap();
        let b = store.stream_append("s", &[]).await.unwrap();
        assert_ne!(a, b);
        let entries = store.stream_range("s").await.unwrap();
        assert_eq!(entries.iter().map(|e| e.id.clone()).collect::<Vec<_>>(), vec![a, b]);
    }
}
