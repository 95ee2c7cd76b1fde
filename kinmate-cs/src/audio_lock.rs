//! Per-audio-unit processing lock
//!
//! Lock state lives in the shared store under `audio:{user}:{audio}:lock`:
//! absent means UNLOCKED, then `PROCESSING`, then `FINALIZED`. Transitions are
//! compare-and-set only, so exactly one request across every process becomes
//! the owner of a unit. The owner publishes its reply to the result cache
//! before marking the unit FINALIZED; later arrivals read that cache.
//!
//! Lock keys carry the request TTL so that abandoned units do not accumulate.

use kinmate_common::{keys, Result, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PROCESSING: &str = "PROCESSING";
const FINALIZED: &str = "FINALIZED";

/// Observed state of an audio unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Processing,
    Finalized,
}

impl LockState {
    fn from_stored(value: Option<&str>) -> Self {
        match value {
            None => LockState::Unlocked,
            Some(FINALIZED) => LockState::Finalized,
            Some(_) => LockState::Processing,
        }
    }
}

/// Result of [`AudioUnitLock::acquire`]
#[derive(Debug)]
pub enum Acquire {
    /// This caller owns the unit and must finish or release it
    Owned(AudioUnitGuard),
    /// Another caller owns (or already finished) the unit
    AlreadyOwned(LockState),
}

/// Audio unit lock handle
#[derive(Clone)]
pub struct AudioUnitLock {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl AudioUnitLock {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Try to move the unit from UNLOCKED to PROCESSING
    pub async fn acquire(&self, user_id: &str, audio_id: &str) -> Result<Acquire> {
        let lock_key = keys::audio_lock(user_id, audio_id);
        if self
            .store
            .compare_and_set(&lock_key, None, PROCESSING, Some(self.ttl))
            .await?
        {
            debug!(user_id, audio_id, "Acquired audio unit");
            return Ok(Acquire::Owned(AudioUnitGuard {
                store: Arc::clone(&self.store),
                lock_key,
                result_key: keys::audio_result(user_id, audio_id),
                ttl: self.ttl,
                armed: true,
            }));
        }
        let state = self.state(user_id, audio_id).await?;
        debug!(user_id, audio_id, ?state, "Audio unit already owned");
        Ok(Acquire::AlreadyOwned(state))
    }

    /// Current state of the unit
    pub async fn state(&self, user_id: &str, audio_id: &str) -> Result<LockState> {
        let value = self.store.get(&keys::audio_lock(user_id, audio_id)).await?;
        Ok(LockState::from_stored(value.as_deref()))
    }

    /// Reply published by the unit's owner, if it has finished
    pub async fn cached_result(&self, user_id: &str, audio_id: &str) -> Result<Option<String>> {
        self.store.get(&keys::audio_result(user_id, audio_id)).await
    }
}

/// Ownership of one audio unit
///
/// Dropping an unfinished guard (panic, cancelled request) finalizes the unit
/// from a background task so it never stays PROCESSING.
pub struct AudioUnitGuard {
    store: Arc<dyn Store>,
    lock_key: String,
    result_key: String,
    ttl: Duration,
    armed: bool,
}

impl std::fmt::Debug for AudioUnitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioUnitGuard")
            .field("lock_key", &self.lock_key)
            .field("armed", &self.armed)
            .finish()
    }
}

impl AudioUnitGuard {
    /// Publish `reply` to the result cache, then mark the unit FINALIZED
    pub async fn finish(mut self, reply: &str) -> Result<()> {
        self.store
            .set(&self.result_key, reply, Some(self.ttl))
            .await?;
        finalize(self.store.as_ref(), &self.lock_key, self.ttl).await?;
        self.armed = false;
        Ok(())
    }

    /// Mark the unit FINALIZED without publishing a reply
    pub async fn release(mut self) -> Result<()> {
        finalize(self.store.as_ref(), &self.lock_key, self.ttl).await?;
        self.armed = false;
        Ok(())
    }
}

async fn finalize(store: &dyn Store, lock_key: &str, ttl: Duration) -> Result<()> {
    if !store
        .compare_and_set(lock_key, Some(PROCESSING), FINALIZED, Some(ttl))
        .await?
    {
        // Expired or already finalized; nothing left to release
        debug!(lock_key, "Audio unit was no longer PROCESSING");
    }
    Ok(())
}

impl Drop for AudioUnitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let lock_key = std::mem::take(&mut self.lock_key);
        let ttl = self.ttl;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(lock_key = %lock_key, "Audio unit guard dropped while PROCESSING, releasing");
                handle.spawn(async move {
                    if let Err(e) = finalize(store.as_ref(), &lock_key, ttl).await {
                        warn!(lock_key = %lock_key, "Failed to release audio unit: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!(lock_key = %lock_key, "Audio unit guard dropped outside a runtime; lock left to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinmate_common::store::MemoryStore;

    fn lock() -> AudioUnitLock {
        AudioUnitLock::new(Arc::new(MemoryStore::new()), Duration::from_secs(600))
    }

    #[tokio::test]
    async fn test_state_progression() {
        let lock = lock();
        assert_eq!(lock.state("u1", "a1").await.unwrap(), LockState::Unlocked);

        let guard = match lock.acquire("u1", "a1").await.unwrap() {
            Acquire::Owned(guard) => guard,
            other => panic!("expected ownership, got {:?}", other),
        };
        assert_eq!(lock.state("u1", "a1").await.unwrap(), LockState::Processing);
        assert!(matches!(
            lock.acquire("u1", "a1").await.unwrap(),
            Acquire::AlreadyOwned(LockState::Processing)
        ));

        guard.finish("hello").await.unwrap();
        assert_eq!(lock.state("u1", "a1").await.unwrap(), LockState::Finalized);
        assert_eq!(lock.cached_result("u1", "a1").await.unwrap().as_deref(), Some("hello"));
        assert!(matches!(
            lock.acquire("u1", "a1").await.unwrap(),
            Acquire::AlreadyOwned(LockState::Finalized)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_owner() {
        let lock = lock();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                match lock.acquire("u1", "a1").await.unwrap() {
                    Acquire::Owned(guard) => {
                        guard.finish("only reply").await.unwrap();
                        true
                    }
                    Acquire::AlreadyOwned(_) => false,
                }
            }));
        }
        let mut owners = 0;
        for handle in handles {
            owners += handle.await.unwrap() as usize;
        }
        assert_eq!(owners, 1);
        assert_eq!(
            lock.cached_result("u1", "a1").await.unwrap().as_deref(),
            Some("only reply")
        );
    }

    #[tokio::test]
    async fn test_release_finalizes_without_result() {
        let lock = lock();
        let Acquire::Owned(guard) = lock.acquire("u1", "a1").await.unwrap() else {
            panic!("expected ownership");
        };
        guard.release().await.unwrap();
        assert_eq!(lock.state("u1", "a1").await.unwrap(), LockState::Finalized);
        assert_eq!(lock.cached_result("u1", "a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_guard_is_released() {
        let lock = lock();
        let Acquire::Owned(guard) = lock.acquire("u1", "a1").await.unwrap() else {
            panic!("expected ownership");
        };
        drop(guard);

        for _ in 0..50 {
            if lock.state("u1", "a1").await.unwrap() == LockState::Finalized {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("dropped guard never finalized the unit");
    }

    #[tokio::test]
    async fn test_units_are_independent() {
        let lock = lock();
        assert!(matches!(lock.acquire("u1", "a1").await.unwrap(), Acquire::Owned(_)));
        assert!(matches!(lock.acquire("u1", "a2").await.unwrap(), Acquire::Owned(_)));
        assert!(matches!(lock.acquire("u2", "a1").await.unwrap(), Acquire::Owned(_)));
    }
}
