// src/timer.rs - Cancellable timer registry shared by timed units
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// Identifier of a registered timer
pub type TimerId = u64;

#[derive(Default)]
struct Inner {
    timers: Mutex<HashMap<TimerId, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Registry of pending timers
///
/// Each timer can be cancelled on its own, which resolves it at once, or all
/// together through [`TimerRegistry::cancel_all`]. Clones share the registry.
///
/// # Examples
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use std::time::Duration;
/// use vesta::timer::TimerRegistry;
///
/// let timers = TimerRegistry::new();
/// let timer = timers.start(Duration::from_secs(3600));
/// timers.cancel(timer.id());
/// assert!(!timer.wait().await);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct TimerRegistry {
    inner: Arc<Inner>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<TimerId, oneshot::Sender<()>>> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a timer; it starts counting immediately
    pub fn start(&self, duration: Duration) -> Timer {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            // `closed` only flips under this guard, so no sender lands after close.
            let mut timers = self.timers();
            if self.inner.closed.load(Ordering::Acquire) {
                drop(tx);
            } else {
                timers.insert(id, tx);
            }
        }
        trace!("Timer {} started for {:?}", id, duration);
        Timer {
            id,
            deadline: tokio::time::Instant::now() + duration,
            cancelled: rx,
            registry: self.clone(),
        }
    }

    /// Wait for `duration`; returns `false` when cancelled early
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.start(duration).wait().await
    }

    /// Cancel one timer, resolving it immediately
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.timers().remove(&id) {
            Some(tx) => {
                let _ = tx.send(());
                trace!("Timer {} cancelled", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer; returns how many were pending
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.timers().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(());
        }
        count
    }

    /// Cancel everything and resolve all future timers immediately
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut timers = self.timers();
            self.inner.closed.store(true, Ordering::Release);
            timers.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of timers still pending
    pub fn active(&self) -> usize {
        self.timers().len()
    }
}

/// A single pending timer
pub struct Timer {
    id: TimerId,
    deadline: tokio::time::Instant,
    cancelled: oneshot::Receiver<()>,
    registry: TimerRegistry,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Resolve when the deadline passes (`true`) or on cancellation (`false`)
    pub async fn wait(mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => true,
            _ = &mut self.cancelled => false,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.registry.timers().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_timer_elapses() {
        let timers = TimerRegistry::new();
        let start = Instant::now();
        assert!(timers.sleep(Duration::from_millis(500)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(timers.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_resolves_everything() {
        let timers = TimerRegistry::new();
        let a = timers.start(Duration::from_secs(10));
        let b = timers.start(Duration::from_secs(20));
        assert_eq!(timers.active(), 2);

        assert_eq!(timers.cancel_all(), 2);
        let start = Instant::now();
        assert!(!a.wait().await);
        assert!(!b.wait().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(timers.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_single_leaves_others() {
        let timers = TimerRegistry::new();
        let a = timers.start(Duration::from_secs(1));
        let b = timers.start(Duration::from_secs(1));
        assert!(timers.cancel(b.id()));
        assert!(!timers.cancel(b.id()));
        assert!(!b.wait().await);
        assert!(a.wait().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_registry_starts_cancelled() {
        let timers = TimerRegistry::new();
        timers.close();
        assert!(!timers.sleep(Duration::from_secs(5)).await);
        assert!(timers.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_cancels_timers_started_concurrently() {
        for _ in 0..50 {
            let timers = TimerRegistry::new();
            let mut sleepers = Vec::new();
            for _ in 0..8 {
                let timers = timers.clone();
                sleepers.push(tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    timers.sleep(Duration::from_secs(3600)).await
                }));
            }
            tokio::task::yield_now().await;
            timers.close();

            for sleeper in sleepers {
                let elapsed = tokio::time::timeout(Duration::from_secs(5), sleeper)
                    .await
                    .expect("timer survived close")
                    .unwrap();
                assert!(!elapsed);
            }
            assert_eq!(timers.active(), 0);
        }
    }
}
