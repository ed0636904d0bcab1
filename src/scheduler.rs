// src/scheduler.rs - Priority task scheduler serializing all wire traffic
//
// The controller correlates replies by service kind only, so two requests of
// the same kind must never be in flight together. Every wire operation is
// therefore submitted here and executed strictly one at a time.

use crate::{
    config::SchedulerConfig,
    error::{PlcError, Result},
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

/// Priority of a read issued by a single-tag or batched operation
pub const PRIORITY_READ: i32 = 1;
/// Priority of writes; they overtake queued reads
pub const PRIORITY_WRITE: i32 = 2;
/// Priority of scan loop reads
pub const PRIORITY_SCAN: i32 = 0;

/// Ordering key of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRecord {
    pub priority: i32,
    /// Monotonic submission sequence
    pub submitted: u64,
}

/// Returns `true` when the first record must run before the second
pub type Comparator = Arc<dyn Fn(&PriorityRecord, &PriorityRecord) -> bool + Send + Sync>;

/// Default comparator: numerically higher priority runs first
pub fn higher_first() -> Comparator {
    Arc::new(|a: &PriorityRecord, b: &PriorityRecord| a.priority > b.priority)
}

// ============================================================================
// PRIORITY QUEUE
// ============================================================================

/// Binary heap ordered by a caller comparator, FIFO among equals
pub struct PriorityQueue<T> {
    items: Vec<(PriorityRecord, T)>,
    compare: Comparator,
}

impl<T> PriorityQueue<T> {
    pub fn new(compare: Comparator) -> Self {
        Self {
            items: Vec::new(),
            compare,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&PriorityRecord> {
        self.items.first().map(|(record, _)| record)
    }

    pub fn push(&mut self, record: PriorityRecord, item: T) {
        self.items.push((record, item));
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<(PriorityRecord, T)> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Drop every queued item
    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn before(&self, a: usize, b: usize) -> bool {
        let (ra, rb) = (&self.items[a].0, &self.items[b].0);
        if (self.compare)(ra, rb) {
            return true;
        }
        !(self.compare)(rb, ra) && ra.submitted < rb.submitted
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.before(idx, parent) {
                break;
            }
            self.items.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;
            if left < len && self.before(left, best) {
                best = left;
            }
            if right < len && self.before(right, best) {
                best = right;
            }
            if best == idx {
                break;
            }
            self.items.swap(idx, best);
            idx = best;
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

type BoxJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Shared {
    queue: Mutex<PriorityQueue<BoxJob>>,
    notify: Arc<Notify>,
    closed: AtomicBool,
    sequence: AtomicU64,
    capacity: usize,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, PriorityQueue<BoxJob>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Wake the worker so it notices every handle is gone.
        self.notify.notify_one();
    }
}

/// Bounded priority scheduler running one job at a time
///
/// Must be created inside a Tokio runtime; the worker task is spawned on
/// construction and exits once the scheduler is closed or dropped.
///
/// # Examples
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> vesta::Result<()> {
/// use vesta::config::SchedulerConfig;
/// use vesta::scheduler::Scheduler;
///
/// let scheduler = Scheduler::new(&SchedulerConfig::default());
/// let answer = scheduler.schedule(1, async { Ok(42) }).await?;
/// assert_eq!(answer, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_comparator(config, higher_first())
    }

    pub fn with_comparator(config: &SchedulerConfig, compare: Comparator) -> Self {
        let notify = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            queue: Mutex::new(PriorityQueue::new(compare)),
            notify: notify.clone(),
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            capacity: config.capacity,
        });
        tokio::spawn(run_worker(Arc::downgrade(&shared), notify, config.delay()));
        debug!(
            "Scheduler started (capacity {}, delay {:?})",
            config.capacity,
            config.delay()
        );
        Self { shared }
    }

    /// Queue a job and wait for its result.
    ///
    /// Fails immediately with [`PlcError::QueueFull`] when the queue is at
    /// capacity. A job's error is returned to its own caller only.
    pub async fn schedule<F, T>(&self, priority: i32, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.submit(priority, job)?;
        rx.await
            .map_err(|_| PlcError::Connection("Scheduler closed before the job ran".into()))?
    }

    fn submit<F, T>(&self, priority: i32, job: F) -> Result<oneshot::Receiver<Result<T>>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PlcError::Connection("Scheduler is closed".into()));
        }
        let (tx, rx) = oneshot::channel();
        let task: BoxJob = Box::pin(async move {
            let _ = tx.send(job.await);
        });
        {
            let mut queue = self.shared.queue();
            if queue.len() >= self.shared.capacity {
                return Err(PlcError::QueueFull(self.shared.capacity));
            }
            let record = PriorityRecord {
                priority,
                submitted: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            };
            trace!("Queued job #{} with priority {}", record.submitted, priority);
            queue.push(record, task);
        }
        self.shared.notify.notify_one();
        Ok(rx)
    }

    /// Jobs waiting to run (the running job is not counted)
    pub fn len(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Stop accepting jobs; queued jobs are rejected, the running one finishes
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.queue().clear();
            self.shared.notify.notify_one();
            debug!("Scheduler closed");
        }
    }
}

async fn run_worker(shared: Weak<Shared>, notify: Arc<Notify>, delay: Duration) {
    loop {
        let next = {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            let next = shared.queue().pop();
            next
        };
        match next {
            Some((record, job)) => {
                trace!("Running job #{}", record.submitted);
                job.await;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            None => notify.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn record(priority: i32, submitted: u64) -> PriorityRecord {
        PriorityRecord { priority, submitted }
    }

    #[test]
    fn test_queue_orders_by_priority_then_fifo() {
        let mut queue = PriorityQueue::new(higher_first());
        for (seq, prio) in [1, 5, 3, 5, 2, 3].into_iter().enumerate() {
            queue.push(record(prio, seq as u64), seq);
        }
        let order: Vec<usize> = std::iter::from_fn(|| queue.pop().map(|(_, i)| i)).collect();
        assert_eq!(order, vec![1, 3, 2, 5, 4, 0]);
    }

    #[test]
    fn test_custom_comparator() {
        let lower_first: Comparator = Arc::new(|a, b| a.priority < b.priority);
        let mut queue = PriorityQueue::new(lower_first);
        queue.push(record(3, 0), "c");
        queue.push(record(1, 1), "a");
        queue.push(record(2, 2), "b");
        assert_eq!(queue.peek().map(|r| r.priority), Some(1));
        assert_eq!(queue.pop().map(|(_, v)| v), Some("a"));
        assert_eq!(queue.pop().map(|(_, v)| v), Some("b"));
        assert_eq!(queue.pop().map(|(_, v)| v), Some("c"));
        assert!(queue.pop().is_none());
    }

    /// Occupy the worker until the returned sender fires
    async fn hold_worker(scheduler: &Scheduler) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel::<()>();
        let s = scheduler.clone();
        tokio::spawn(async move {
            let _ = s
                .schedule(100, async move {
                    let _ = gate.await;
                    Ok(())
                })
                .await;
        });
        while !scheduler.is_empty() || !started(scheduler) {
            tokio::task::yield_now().await;
        }
        release
    }

    fn started(scheduler: &Scheduler) -> bool {
        scheduler.shared.sequence.load(Ordering::Relaxed) > 0
    }

    #[tokio::test]
    async fn test_runs_in_priority_order() {
        let scheduler = Scheduler::new(&SchedulerConfig::default());
        let release = hold_worker(&scheduler).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (label, prio) in [("low", 1), ("high-a", 5), ("mid", 3), ("high-b", 5)] {
            let s = scheduler.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                s.schedule(prio, async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                })
                .await
            }));
            while scheduler.len() < handles.len() {
                tokio::task::yield_now().await;
            }
        }

        release.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high-a", "high-b", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let config = SchedulerConfig {
            capacity: 2,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(&config);
        let release = hold_worker(&scheduler).await;

        let _a = scheduler.submit(1, async { Ok(()) }).unwrap();
        let _b = scheduler.submit(1, async { Ok(()) }).unwrap();
        let err = scheduler.schedule(1, async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, PlcError::QueueFull(2)));

        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_queue() {
        let scheduler = Scheduler::new(&SchedulerConfig::default());
        let failed: Result<()> = scheduler
            .schedule(1, async { Err(PlcError::Validation("boom".into())) })
            .await;
        assert!(failed.is_err());
        assert_eq!(scheduler.schedule(1, async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_job_delay() {
        let config = SchedulerConfig {
            inter_request_delay_ms: 50,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(&config);
        let start = Instant::now();
        scheduler.schedule(1, async { Ok(()) }).await.unwrap();
        scheduler.schedule(1, async { Ok(()) }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_closed_scheduler_rejects() {
        let scheduler = Scheduler::new(&SchedulerConfig::default());
        scheduler.close();
        let err = scheduler.schedule(1, async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, PlcError::Connection(_)));
    }
}
