use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::signal::SignalRegistry;
use crate::task::{Task, TaskPriority, TaskSet};

/// Upper bound on threads that index per-thread state (workers of both
/// pools plus the main thread).
pub const MAX_THREADS: usize = 64;

/// Slots scanned per step of the equality scan, matching a 256-bit
/// compare lane width.
const SCAN_LANES: usize = 4;
const _: () = assert!(MAX_THREADS % SCAN_LANES == 0);

/// Nonzero key unique to each live thread: the address of a thread-local
/// anchor.
fn thread_key() -> u64 {
    thread_local! {
        static ANCHOR: u8 = const { 0 };
    }
    ANCHOR.with(|anchor| anchor as *const u8 as usize as u64)
}

/// Shared thread-id table. Threads claim a slot once at startup with a
/// single compare-exchange; afterwards [`ThreadIndexTable::current_index`]
/// is a wait-free equality scan over the slots (four lanes per step, one
/// atomic load each), used to pick per-thread arenas and allocators.
///
/// Slots are never recycled, so every registration must outlive the
/// table's lookups.
pub struct ThreadIndexTable {
    slots: [AtomicU64; MAX_THREADS],
    len: AtomicUsize,
}

impl Default for ThreadIndexTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadIndexTable {
    pub fn new() -> Self {
        // 0 marks a free slot; thread keys are addresses, never 0
        const EMPTY_SLOT: AtomicU64 = AtomicU64::new(0);
        Self {
            slots: [EMPTY_SLOT; MAX_THREADS],
            len: AtomicUsize::new(0),
        }
    }

    /// Registers the calling thread and returns its stable index. Each
    /// slot is tried at most once, so concurrent registrations never wait
    /// on one another.
    pub fn register_current(&self) -> usize {
        let key = thread_key();
        for (idx, slot) in self.slots.iter().enumerate() {
            match slot.compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Release);
                    return idx;
                }
                Err(occupied) => {
                    debug_assert!(occupied != key, "thread registered twice");
                }
            }
        }
        panic!("thread table exhausted");
    }

    /// Index of the calling thread: a pure-load scan, four slots per step.
    /// Panics if the thread never registered; only pool workers and the
    /// main thread touch per-thread state.
    pub fn current_index(&self) -> usize {
        let key = thread_key();
        let mut base = 0;
        while base < MAX_THREADS {
            let lanes = [
                self.slots[base].load(Ordering::Acquire),
                self.slots[base + 1].load(Ordering::Acquire),
                self.slots[base + 2].load(Ordering::Acquire),
                self.slots[base + 3].load(Ordering::Acquire),
            ];
            for (lane, &value) in lanes.iter().enumerate() {
                if value == key {
                    return base + lane;
                }
            }
            base += SCAN_LANES;
        }
        panic!("calling thread is not registered with the pool");
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PoolShared {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    signals: Arc<SignalRegistry>,
    thread_table: Arc<ThreadIndexTable>,
    /// Tasks enqueued since the last successful flush.
    submitted: AtomicU64,
    /// Tasks fully executed since the last successful flush.
    finished: AtomicU64,
    /// Tasks currently sitting in the queue.
    in_queue: AtomicU64,
    shutdown: AtomicBool,
}

impl PoolShared {
    fn run_task(&self, task: Task) {
        let priority = task.priority();
        if priority != TaskPriority::Background {
            // block until every predecessor has signaled
            self.signals.wait_for_head_nodes(task.signal_handle());
        }

        let adjacencies: Vec<_> = task.adjacencies().to_vec();
        let name = task.name().to_owned();

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        if result.is_err() {
            // tasks are not permitted to fail; tear the process down
            log::error!("task '{}' panicked; aborting", name);
            std::process::abort();
        }

        if priority != TaskPriority::Background && !adjacencies.is_empty() {
            self.signals.signal_tail_nodes(&adjacencies);
        }

        self.finished.fetch_add(1, Ordering::Release);
    }
}

/// A fixed pool of worker threads draining one MPMC queue.
///
/// The engine owns two: a foreground pool sized to the physical core count
/// and a smaller background pool for fire-and-forget work.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        pool_size: usize,
        name_prefix: &str,
        signals: Arc<SignalRegistry>,
        thread_table: Arc<ThreadIndexTable>,
    ) -> Self {
        assert!(pool_size > 0, "pool needs at least one worker");
        let (sender, receiver) = crossbeam_channel::unbounded();

        let shared = Arc::new(PoolShared {
            sender,
            receiver,
            signals,
            thread_table,
            submitted: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            in_queue: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..pool_size)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("{}_{}", name_prefix, i))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        log::info!("started pool '{}' with {} workers", name_prefix, pool_size);

        Self { shared, workers }
    }

    /// Physical-core-count sizing for the foreground pool, leaving one core
    /// for the main thread.
    pub fn default_foreground_size() -> usize {
        num_cpus::get_physical().saturating_sub(1).max(1)
    }

    pub fn enqueue(&self, task: Task) {
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.in_queue.fetch_add(1, Ordering::Release);
        self.shared
            .sender
            .send(task)
            .expect("task queue disconnected");
    }

    /// Submits a finalized task set in bulk.
    pub fn enqueue_set(&self, set: TaskSet) {
        assert!(set.is_finalized(), "task set must be finalized before submission");
        let tasks = set.into_tasks();
        self.shared
            .submitted
            .fetch_add(tasks.len() as u64, Ordering::Relaxed);
        self.shared
            .in_queue
            .fetch_add(tasks.len() as u64, Ordering::Release);
        for task in tasks {
            self.shared.sender.send(task).expect("task queue disconnected");
        }
    }

    /// Drains the queue from the calling thread until it observes empty.
    pub fn pump_until_empty(&self) {
        while self.shared.in_queue.load(Ordering::Acquire) != 0 {
            match self.shared.receiver.try_recv() {
                Ok(task) => {
                    self.shared.in_queue.fetch_sub(1, Ordering::Relaxed);
                    self.shared.run_task(task);
                }
                Err(_) => thread::yield_now(),
            }
        }
    }

    /// Returns true only when every submitted task has finished, resetting
    /// the counters for the next batch. Otherwise helps drain the queue and
    /// returns false; the caller loops.
    pub fn try_flush(&self) -> bool {
        let flushed = self.shared.finished.load(Ordering::Acquire)
            == self.shared.submitted.load(Ordering::Acquire);
        if flushed {
            self.shared.finished.store(0, Ordering::Relaxed);
            self.shared.submitted.store(0, Ordering::Relaxed);
        } else {
            self.pump_until_empty();
        }
        flushed
    }

    /// Blocks (while helping) until all submitted work has finished.
    pub fn flush(&self) {
        profiling::scope!("pool_flush");
        while !self.try_flush() {
            thread::yield_now();
        }
    }

    /// Unblocks every worker with a no-op task, then joins them.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        for _ in 0..self.workers.len() {
            self.enqueue(Task::new("noop", TaskPriority::Normal, || {}));
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        log::info!("pool shut down");
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    shared.thread_table.register_current();
    log::debug!("worker {:?} waiting for tasks", thread::current().id());

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        // blocks while the queue is empty
        let Ok(task) = shared.receiver.recv() else {
            break;
        };
        shared.in_queue.fetch_sub(1, Ordering::Relaxed);
        shared.run_task(task);
    }

    log::debug!("worker {:?} exiting", thread::current().id());
}
