//! The worker pool behind [`run_in_thread`] and [`run_in_thread_sync`].
//!
//! A process-wide pool of OS threads with a nominal width of
//! [`POOL_WIDTH`]. Queued work is ordered by task priority, ties broken by
//! enqueue order, with one exception: entries whose cancellable has been
//! cancelled jump to the front so the cancelled result is delivered
//! promptly.
//!
//! Workers that block waiting on a nested synchronous task announce it
//! through [`block_in_place`]; while any are blocked the pool spawns
//! transient workers beyond the nominal width (capped at a hard maximum) so
//! chains of nested offloads cannot deadlock the pool. Idle workers retire
//! after a short timeout.
//!
//! [`run_in_thread`]: crate::TaskProducer::run_in_thread
//! [`run_in_thread_sync`]: crate::TaskProducer::run_in_thread_sync

use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::logging::targets;
use crate::source::Priority;
use crate::task::TaskInner;

/// Nominal number of pool workers.
///
/// More tasks than this can be queued; they wait in the priority queue
/// unless transient workers are active.
pub const POOL_WIDTH: usize = 10;

/// Hard cap on pool threads, nominal plus transient.
const MAX_WORKERS: usize = 130;

/// How long an idle worker lingers before retiring.
const IDLE_TIMEOUT: Duration = Duration::from_millis(500);

static POOL: OnceLock<Pool> = OnceLock::new();

thread_local! {
    /// Whether the current thread is a pool worker, for nested-block
    /// accounting in [`block_in_place`].
    static IS_POOL_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// A queued unit of pool work.
type Job = Box<dyn FnOnce() + Send>;

struct QueueEntry {
    /// Cancelled tasks sort first regardless of priority.
    urgent: bool,
    priority: Priority,
    seq: u64,
    task: Arc<TaskInner>,
    job: Job,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: "greater" pops first. Urgent entries
        // first, then lower priority values, then earlier sequence numbers.
        self.urgent
            .cmp(&other.urgent)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    /// Worker threads currently alive.
    live: usize,
    /// Workers waiting for work.
    idle: usize,
    /// Workers blocked inside a nested synchronous wait.
    blocked: usize,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    work: Condvar,
}

struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(PoolQueue {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    live: 0,
                    idle: 0,
                    blocked: 0,
                }),
                work: Condvar::new(),
            }),
        }
    }
}

fn pool() -> &'static Pool {
    POOL.get_or_init(Pool::new)
}

/// Effective thread budget: nominal width plus one per blocked worker,
/// bounded by the hard cap.
fn width_limit(queue: &PoolQueue) -> usize {
    (POOL_WIDTH + queue.blocked).min(MAX_WORKERS)
}

/// Spawn a worker if there is queued work nobody is going to pick up.
fn maybe_spawn_locked(shared: &Arc<PoolShared>, queue: &mut PoolQueue) {
    if queue.heap.is_empty() || queue.idle > 0 || queue.live >= width_limit(queue) {
        return;
    }
    queue.live += 1;
    tracing::trace!(
        target: targets::POOL,
        live = queue.live,
        blocked = queue.blocked,
        "spawning pool worker"
    );
    let shared = shared.clone();
    thread::Builder::new()
        .name("ebbtide-pool".to_string())
        .spawn(move || worker_main(shared))
        .expect("failed to spawn pool worker thread");
}

/// Enqueue a task's worker function.
///
/// The entry holds a strong reference on the task record from enqueue until
/// the worker function has returned.
pub(crate) fn push(task: Arc<TaskInner>, job: Job) {
    let priority = task.pool_priority();
    let urgent = task.cancellable_cancelled();
    let shared = &pool().shared;
    let mut queue = shared.queue.lock();
    let seq = queue.next_seq;
    queue.next_seq += 1;
    queue.heap.push(QueueEntry {
        urgent,
        priority,
        seq,
        task,
        job,
    });
    maybe_spawn_locked(shared, &mut queue);
    shared.work.notify_one();
}

/// Re-sort the queue after a cancellation so cancelled entries come first.
pub(crate) fn resort() {
    let Some(pool) = POOL.get() else { return };
    let mut queue = pool.shared.queue.lock();
    if queue.heap.is_empty() {
        return;
    }
    queue.heap = std::mem::take(&mut queue.heap)
        .into_iter()
        .map(|mut entry| {
            entry.urgent = entry.task.cancellable_cancelled();
            entry
        })
        .collect();
}

/// Run a blocking wait, with nested-worker accounting.
///
/// Called on an ordinary thread this just runs `wait`. Called on a pool
/// worker it raises the pool's thread budget for the duration, spawning a
/// replacement worker if queued work would otherwise starve.
pub(crate) fn block_in_place<R>(wait: impl FnOnce() -> R) -> R {
    if !IS_POOL_WORKER.with(Cell::get) {
        return wait();
    }
    let shared = &pool().shared;
    {
        let mut queue = shared.queue.lock();
        queue.blocked += 1;
        maybe_spawn_locked(shared, &mut queue);
    }
    let result = wait();
    shared.queue.lock().blocked -= 1;
    result
}

/// Decrements the live count even if a job panics the worker thread.
struct WorkerExitGuard(Arc<PoolShared>);

impl Drop for WorkerExitGuard {
    fn drop(&mut self) {
        self.0.queue.lock().live -= 1;
    }
}

fn worker_main(shared: Arc<PoolShared>) {
    let _exit = WorkerExitGuard(shared.clone());
    IS_POOL_WORKER.with(|flag| flag.set(true));

    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                // Transient workers retire as soon as the budget shrinks back.
                if queue.live > width_limit(&queue) && queue.heap.is_empty() {
                    return;
                }
                if let Some(entry) = queue.heap.pop() {
                    break entry;
                }
                queue.idle += 1;
                let timed_out = shared.work.wait_for(&mut queue, IDLE_TIMEOUT).timed_out();
                queue.idle -= 1;
                if timed_out && queue.heap.is_empty() {
                    return;
                }
            }
        };
        (entry.job)();
        TaskInner::worker_finished(&entry.task);
    }
}
