//! Active user sessions
//!
//! A session starts with a user's first turn and owns that user's idle
//! watchdog. It ends exactly once, either when the watchdog fires or when it
//! is closed explicitly (shutdown, API). Ending a session runs the finalizer,
//! releases the cached assistant and broadcasts `SessionFinalized`.
//!
//! A finalizing session keeps its map entry until the finalizer returns.
//! Activity for that user waits for it, so a purge can only remove rounds of
//! the session being finalized.

use crate::collaborators::SessionFinalizer;
use crate::registry::AssistantRegistry;
use crate::watchdog::SessionWatchdog;
use kinmate_common::events::{CompanionEvent, EventBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

struct UserSession {
    generation: u64,
    watchdog: SessionWatchdog,
    /// Cancelled once the session has been finalized and removed
    finalized: CancellationToken,
}

struct SessionInner {
    sessions: Mutex<HashMap<String, UserSession>>,
    next_generation: AtomicU64,
    registry: Arc<AssistantRegistry>,
    finalizer: Arc<dyn SessionFinalizer>,
    events: EventBus,
    idle_timeout: Duration,
    poll: Duration,
}

impl SessionInner {
    /// Watchdog path: the watchdog has already halted itself
    async fn on_idle(&self, user_id: &str, generation: u64) {
        self.finalize(user_id).await;
        self.retire(user_id, generation).await;
    }

    /// Drop the finalized entry and wake activity waiting on it
    async fn retire(&self, user_id: &str, generation: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(user_id).is_some_and(|s| s.generation == generation) {
            if let Some(session) = sessions.remove(user_id) {
                session.finalized.cancel();
            }
        }
    }

    async fn finalize(&self, user_id: &str) -> String {
        let summary = match self.finalizer.finalize(user_id).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(user_id, "Session finalizer failed: {}", e);
                String::new()
            }
        };
        self.registry.release(user_id).await;
        info!(user_id, "Session finalized");
        self.events.emit_lossy(CompanionEvent::SessionFinalized {
            user_id: user_id.to_string(),
            summary: summary.clone(),
            timestamp: kinmate_common::time::now(),
        });
        summary
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<AssistantRegistry>,
        finalizer: Arc<dyn SessionFinalizer>,
        events: EventBus,
        idle_timeout: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                sessions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                registry,
                finalizer,
                events,
                idle_timeout,
                poll,
            }),
        }
    }

    /// Record activity, starting a session if none is running
    ///
    /// Waits while the user's previous session is being finalized.
    pub async fn touch(&self, user_id: &str) {
        let mut sessions = loop {
            let sessions = self.inner.sessions.lock().await;
            let finalized = match sessions.get(user_id) {
                None => None,
                Some(session) if session.watchdog.touch() => return,
                Some(session) => Some(session.finalized.clone()),
            };
            let Some(finalized) = finalized else {
                break sessions;
            };
            drop(sessions);
            debug!(user_id, "Waiting for previous session to finalize");
            finalized.cancelled().await;
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let owned_user = user_id.to_string();
        let watchdog = SessionWatchdog::spawn(
            user_id,
            self.inner.idle_timeout,
            self.inner.poll,
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_idle(&owned_user, generation).await;
                }
            },
        );
        watchdog.touch();
        info!(user_id, generation, "Session started");
        sessions.insert(
            user_id.to_string(),
            UserSession {
                generation,
                watchdog,
                finalized: CancellationToken::new(),
            },
        );
    }

    /// Finalize a running session now
    ///
    /// Returns the summary, or `None` if the user has no running session
    /// (or its watchdog is already finalizing it).
    pub async fn close(&self, user_id: &str) -> Option<String> {
        let generation = {
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(user_id) {
                Some(session) if session.watchdog.halt() => session.generation,
                _ => return None,
            }
        };
        let summary = self.inner.finalize(user_id).await;
        self.inner.retire(user_id, generation).await;
        Some(summary)
    }

    /// Finalize every running session; returns how many were closed
    pub async fn close_all(&self) -> usize {
        let users: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        let mut closed = 0;
        for user_id in users {
            if self.close(&user_id).await.is_some() {
                closed += 1;
            }
        }
        closed
    }

    pub async fn is_active(&self, user_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .await
            .get(user_id)
            .is_some_and(|s| !s.watchdog.is_halted())
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.lock().await.is_empty()
    }
}
