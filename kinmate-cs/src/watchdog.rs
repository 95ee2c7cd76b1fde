//! Session idle watchdog
//!
//! One background task per session polls the activity clock. When the session
//! has been idle longer than the timeout the `on_idle` action runs once and
//! the watchdog halts for good; later activity does not revive it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lock-free last-activity timestamp
///
/// Stored as milliseconds since the clock's origin plus one, so that zero
/// means "never active".
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let offset = self.origin.elapsed().as_millis() as u64 + 1;
        self.last.store(offset, Ordering::Release);
    }

    /// Time since the last touch, `None` if never touched
    pub fn idle_for(&self) -> Option<Duration> {
        match self.last.load(Ordering::Acquire) {
            0 => None,
            offset => Some(
                self.origin
                    .elapsed()
                    .saturating_sub(Duration::from_millis(offset - 1)),
            ),
        }
    }
}

pub struct SessionWatchdog {
    clock: Arc<ActivityClock>,
    halted: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionWatchdog {
    /// Start watching; `on_idle` runs at most once
    pub fn spawn<F, Fut>(user_id: &str, idle_timeout: Duration, poll: Duration, on_idle: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let clock = Arc::new(ActivityClock::new());
        let halted = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            user_id.to_string(),
            Arc::clone(&clock),
            Arc::clone(&halted),
            cancel.clone(),
            idle_timeout,
            poll,
            on_idle,
        ));

        Self {
            clock,
            halted,
            cancel,
            task,
        }
    }

    /// Record activity; ignored (and `false`) once halted
    pub fn touch(&self) -> bool {
        if self.is_halted() {
            return false;
        }
        self.clock.touch();
        true
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.clock.idle_for()
    }

    /// Halt the watchdog without running `on_idle`
    ///
    /// Returns `true` if this call performed the halt, which makes the caller
    /// responsible for finalizing the session instead.
    pub fn halt(&self) -> bool {
        let first = self
            .halted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.cancel.cancel();
        first
    }

    /// Cancel the watchdog without finalizing
    pub fn stop(&self) {
        self.halt();
    }

    /// Whether the background task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionWatchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<F, Fut>(
    user_id: String,
    clock: Arc<ActivityClock>,
    halted: Arc<AtomicBool>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    poll: Duration,
    on_idle: F,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(user_id = %user_id, "Watchdog cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(idle) = clock.idle_for() else {
            continue;
        };
        if idle <= idle_timeout {
            continue;
        }

        if halted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(user_id = %user_id, idle_secs = idle.as_secs(), "Session idle, finalizing");
            cancel.cancel();
            on_idle().await;
        }
        return;
    }
}
