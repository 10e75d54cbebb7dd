use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::clock::SharedClock;
use crate::error::CacheError;
use crate::metrics::Metrics;

/// How long an idle worker parks before re-checking peers for work to
/// steal. Bounds the latency of a steal when the victim never signals.
const IDLE_PARK: Duration = Duration::from_millis(20);

/// One unit of background work: a write-behind flush, a cache warm-up, or
/// anything else the facade schedules. Owned by exactly one queue at a
/// time; executed at most once.
pub struct WorkItem {
    pub job: Box<dyn FnOnce() + Send + 'static>,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
}

impl WorkItem {
    pub fn new(now: Instant, job: impl FnOnce() + Send + 'static) -> Self {
        WorkItem {
            job: Box::new(job),
            enqueued_at: now,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A work item discarded unexecuted because its deadline (or the shutdown
/// grace deadline) had passed.
#[derive(Debug, Clone)]
pub struct DroppedItem {
    pub enqueued_at: Instant,
}

struct WorkerQueue {
    items: Mutex<VecDeque<WorkItem>>,
    ready: Condvar,
    /// Cached queue length so `submit` can sample depths without taking
    /// any queue lock.
    depth: AtomicUsize,
}

impl WorkerQueue {
    fn new() -> Self {
        WorkerQueue {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            depth: AtomicUsize::new(0),
        }
    }

    fn pop_front(&self) -> Option<WorkItem> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        self.depth.store(items.len(), Ordering::Relaxed);
        item
    }

    /// Steal from the opposite end the owner consumes from.
    fn steal_back(&self) -> Option<WorkItem> {
        let mut items = self.items.lock();
        let item = items.pop_back();
        self.depth.store(items.len(), Ordering::Relaxed);
        item
    }
}

struct PoolShared {
    queues: Vec<Arc<WorkerQueue>>,
    shutdown: AtomicBool,
    grace_deadline: Mutex<Option<Instant>>,
    metrics: Arc<Metrics>,
    clock: SharedClock,
    dropped_tx: Sender<DroppedItem>,
}

impl PoolShared {
    fn past_grace(&self, now: Instant) -> bool {
        self.grace_deadline.lock().map_or(false, |d| now >= d)
    }

    /// Run or drop one item. Panics inside the job are caught here so a
    /// misbehaving backing store cannot take a worker down.
    fn execute(&self, item: WorkItem) {
        let now = self.clock.now();
        let expired = item.deadline.map_or(false, |d| now >= d) || self.past_grace(now);
        if expired {
            Metrics::incr(&self.metrics.dropped_items);
            let _ = self.dropped_tx.send(DroppedItem {
                enqueued_at: item.enqueued_at,
            });
            return;
        }
        Metrics::incr(&self.metrics.executed);
        if catch_unwind(AssertUnwindSafe(item.job)).is_err() {
            Metrics::incr(&self.metrics.worker_panics);
            tracing::warn!("work item panicked");
        }
    }
}

/// Fixed-size pool of workers with per-worker queues and work stealing.
///
/// `submit` enqueues to the shallowest local queue. A worker drains its
/// own queue from the front; when empty it visits the other queues in a
/// randomized rotation and steals one item from the back. At most one
/// queue lock is held at a time and no lock is held across execution, so
/// the pool cannot deadlock on its own queues.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    dropped_rx: Receiver<DroppedItem>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, metrics: Arc<Metrics>, clock: SharedClock) -> Self {
        let (dropped_tx, dropped_rx) = unbounded();
        let queues = (0..worker_count)
            .map(|_| Arc::new(WorkerQueue::new()))
            .collect();
        let shared = Arc::new(PoolShared {
            queues,
            shutdown: AtomicBool::new(worker_count == 0),
            grace_deadline: Mutex::new(None),
            metrics,
            clock,
            dropped_tx,
        });
        let handles = (0..worker_count)
            .map(|worker_idx| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("weir-worker-{worker_idx}"))
                    .spawn(move || worker_loop(shared, worker_idx))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkerPool {
            shared,
            handles: Mutex::new(handles),
            dropped_rx,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// Enqueue onto the least-loaded queue. Refused after shutdown.
    pub fn submit(&self, item: WorkItem) -> Result<(), CacheError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::ShuttingDown);
        }
        let target = self
            .shared
            .queues
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.depth.load(Ordering::Relaxed))
            .map(|(idx, _)| idx)
            .ok_or(CacheError::ShuttingDown)?;
        let queue = &self.shared.queues[target];
        // Re-check under the queue lock. A shutdown that wins this race
        // drains the queue after taking the same lock, so the item is
        // either refused here or seen by that drain, never lost.
        let mut items = queue.items.lock();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::ShuttingDown);
        }
        items.push_back(item);
        queue.depth.store(items.len(), Ordering::Relaxed);
        queue.ready.notify_one();
        Ok(())
    }

    /// Items dropped past their deadline during shutdown land here.
    pub fn dropped(&self) -> &Receiver<DroppedItem> {
        &self.dropped_rx
    }

    /// Stop accepting work and drain. In-flight items run to completion;
    /// once `grace` elapses, remaining items are surfaced on the dropped
    /// channel instead of executing. Idempotent.
    pub fn shutdown(&self, grace: Option<Duration>) {
        {
            // Publish the grace deadline before the flag so no worker can
            // observe shutdown with a stale deadline.
            let mut deadline = self.shared.grace_deadline.lock();
            if !self.shared.shutdown.load(Ordering::Acquire) {
                *deadline = grace.map(|g| self.shared.clock.now() + g);
            }
        }
        self.shared.shutdown.store(true, Ordering::Release);
        for queue in &self.shared.queues {
            queue.ready.notify_all();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        // Anything a racing submit slipped in after the workers left is
        // surfaced on the dropped channel rather than silently lost.
        for queue in &self.shared.queues {
            while let Some(item) = queue.pop_front() {
                Metrics::incr(&self.shared.metrics.dropped_items);
                let _ = self.shared.dropped_tx.send(DroppedItem {
                    enqueued_at: item.enqueued_at,
                });
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Drain fully: pending write-behind flushes must not be lost just
        // because the pool was dropped without an explicit shutdown.
        self.shutdown(None);
    }
}

fn worker_loop(shared: Arc<PoolShared>, worker_idx: usize) {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let own = Arc::clone(&shared.queues[worker_idx]);
    let peers = shared.queues.len();

    loop {
        if let Some(item) = own.pop_front() {
            shared.execute(item);
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Randomized steal round: one item from the tail of some peer.
        let start = if peers > 1 { rng.gen_range(0..peers) } else { 0 };
        let mut stolen = None;
        for offset in 0..peers {
            let victim = (start + offset) % peers;
            if victim == worker_idx {
                continue;
            }
            if let Some(item) = shared.queues[victim].steal_back() {
                Metrics::incr(&shared.metrics.steals);
                stolen = Some(item);
                break;
            }
        }
        if let Some(item) = stolen {
            shared.execute(item);
            continue;
        }

        let mut guard = own.items.lock();
        if guard.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
            own.ready.wait_for(&mut guard, IDLE_PARK);
        }
    }
    tracing::debug!(worker = worker_idx, "worker exiting");
}
