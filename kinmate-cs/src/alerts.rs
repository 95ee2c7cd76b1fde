//! Risk alert emission
//!
//! Alerts are fire-and-forget: store failures are logged and never surface to
//! the turn that raised them.

use kinmate_common::events::{CompanionEvent, EventBus};
use kinmate_common::{keys, Error, Result, Store};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert as stored in the per-user snapshot list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub user_id: String,
    pub reason: String,
    pub severity: Severity,
    /// Milliseconds since the Unix epoch
    pub ts: i64,
}

#[derive(Clone)]
pub struct AlertEmitter {
    store: Arc<dyn Store>,
    stream_key: String,
    keywords: Vec<String>,
    events: EventBus,
}

impl AlertEmitter {
    pub fn new(
        store: Arc<dyn Store>,
        stream_key: impl Into<String>,
        keywords: &[String],
        events: EventBus,
    ) -> Self {
        Self {
            store,
            stream_key: stream_key.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            events,
        }
    }

    /// Whether a block reason names one of the alerting keywords
    pub fn should_alert(&self, reason: &str) -> bool {
        let reason = reason.to_lowercase();
        self.keywords.iter().any(|k| !k.is_empty() && reason.contains(k.as_str()))
    }

    /// Append an alert to the alert stream and the user's snapshot list
    ///
    /// Returns the stream entry id, or `None` if the stream write failed.
    pub async fn emit(&self, user_id: &str, reason: &str, severity: Severity) -> Option<String> {
        let record = AlertRecord {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
            severity,
            ts: kinmate_common::time::now_millis(),
        };
        let fields = vec![
            ("user_id".to_string(), record.user_id.clone()),
            ("reason".to_string(), record.reason.clone()),
            ("severity".to_string(), severity.to_string()),
            ("ts".to_string(), record.ts.to_string()),
        ];

        let id = match self.store.stream_append(&self.stream_key, &fields).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(user_id, "Failed to append alert to {}: {}", self.stream_key, e);
                None
            }
        };

        if let Err(e) = self.push_snapshot(&record).await {
            warn!(user_id, "Failed to record alert snapshot: {}", e);
        }

        info!(user_id, severity = %severity, reason, "Risk alert raised");
        self.events.emit_lossy(CompanionEvent::AlertRaised {
            user_id: record.user_id,
            reason: record.reason,
            severity: severity.to_string(),
            timestamp: kinmate_common::time::now(),
        });
        id
    }

    async fn push_snapshot(&self, record: &AlertRecord) -> Result<()> {
        let encoded = serde_json::to_string(record)?;
        self.store
            .list_push(&keys::user_alerts(&record.user_id), &encoded)
            .await?;
        Ok(())
    }

    /// Read and clear the user's alert snapshot
    pub async fn pop_all(&self, user_id: &str) -> Result<Vec<AlertRecord>> {
        self.store
            .list_drain(&keys::user_alerts(user_id))
            .await?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinmate_common::store::MemoryStore;

    fn emitter() -> (Arc<MemoryStore>, AlertEmitter) {
        let store = Arc::new(MemoryStore::new());
        let keywords: Vec<String> = ["自殺", "Suicide"].iter().map(|s| s.to_string()).collect();
        let emitter = AlertEmitter::new(store.clone(), "alerts:stream", &keywords, EventBus::new(16));
        (store, emitter)
    }

    #[test]
    fn test_should_alert_matches_keywords_case_insensitively() {
        let (_, emitter) = emitter();
        assert!(emitter.should_alert("keywords detected: 自殺"));
        assert!(emitter.should_alert("mentions SUICIDE plans"));
        assert!(!emitter.should_alert("keywords detected: bomb"));
        assert!(!emitter.should_alert(""));
    }

    #[tokio::test]
    async fn test_emit_writes_stream_and_snapshot() {
        let (store, emitter) = emitter();
        let id = emitter.emit("u1", "keywords detected: 自殺", Severity::High).await;
        assert!(id.is_some());

        let entries = store.stream_range("alerts:stream").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("user_id"), Some("u1"));
        assert_eq!(entries[0].field("severity"), Some("high"));
        assert_eq!(entries[0].field("reason"), Some("keywords detected: 自殺"));
        assert!(entries[0].field("ts").is_some());

        let snapshot = emitter.pop_all("u1").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].severity, Severity::High);
        assert!(emitter.pop_all("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emit_broadcasts_event() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let emitter = AlertEmitter::new(store, "alerts:stream", &[], bus);

        emitter.emit("u1", "fall detected", Severity::Medium).await;
        match rx.recv().await.unwrap() {
            CompanionEvent::AlertRaised { severity, .. } => assert_eq!(severity, "medium"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
