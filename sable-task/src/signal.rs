use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::{Condvar, Mutex};

/// Handle to a task signal in the registry. `INVALID` marks tasks that do
/// not participate in dependency tracking (background work).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalHandle(pub(crate) i32);

impl SignalHandle {
    pub const INVALID: Self = Self(-1);

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

struct Signal {
    /// Number of unfinished predecessor tasks.
    indegree: AtomicI32,
    /// Block flag, set under the lock on the 1 -> 0 transition.
    done: Mutex<bool>,
    cv: Condvar,
}

/// Fixed-capacity registry of task signals with free-list slot reuse.
///
/// Shared between the foreground and background pools so cross-pool task
/// sets keep working against one namespace of handles.
pub struct SignalRegistry {
    signals: Vec<Signal>,
    free: Mutex<Vec<i32>>,
}

impl SignalRegistry {
    pub fn new(capacity: usize) -> Self {
        let signals = (0..capacity)
            .map(|_| Signal {
                indegree: AtomicI32::new(0),
                done: Mutex::new(false),
                cv: Condvar::new(),
            })
            .collect();
        Self {
            signals,
            free: Mutex::new((0..capacity as i32).rev().collect()),
        }
    }

    /// Reserves a signal slot for a task. The indegree is recorded later,
    /// at finalization.
    pub fn register(&self) -> SignalHandle {
        let idx = self
            .free
            .lock()
            .pop()
            .expect("signal registry exhausted; too many in-flight tasks");
        SignalHandle(idx)
    }

    /// Records the finalized indegree for `handle`. A zero indegree leaves
    /// the signal immediately passable.
    pub fn finalized(&self, handle: SignalHandle, indegree: i32) {
        debug_assert!(indegree >= 0);
        let signal = &self.signals[handle.0 as usize];
        signal.indegree.store(indegree, Ordering::Relaxed);
        *signal.done.lock() = indegree == 0;
    }

    /// Blocks until every predecessor of `handle` has signaled, then frees
    /// the slot for reuse. Called by the worker that dequeued the task.
    pub fn wait_for_head_nodes(&self, handle: SignalHandle) {
        if !handle.is_valid() {
            return;
        }
        let signal = &self.signals[handle.0 as usize];
        {
            let mut done = signal.done.lock();
            while !*done {
                signal.cv.wait(&mut done);
            }
        }
        self.free.lock().push(handle.0);
    }

    /// Decrements the indegree of every adjacent task; the 1 -> 0
    /// transition wakes that task's waiter.
    pub fn signal_tail_nodes(&self, adjacencies: &[SignalHandle]) {
        for handle in adjacencies {
            debug_assert!(handle.is_valid());
            let signal = &self.signals[handle.0 as usize];
            let prev = signal.indegree.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "task signaled more times than its indegree");
            if prev == 1 {
                let mut done = signal.done.lock();
                *done = true;
                signal.cv.notify_all();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_indegree_passes_immediately() {
        let registry = SignalRegistry::new(8);
        let h = registry.register();
        registry.finalized(h, 0);
        registry.wait_for_head_nodes(h);
        assert_eq!(registry.free_count(), 8);
    }

    #[test]
    fn signals_release_waiters() {
        let registry = std::sync::Arc::new(SignalRegistry::new(8));
        let h = registry.register();
        registry.finalized(h, 2);

        let r2 = registry.clone();
        let waiter = std::thread::spawn(move || r2.wait_for_head_nodes(h));

        registry.signal_tail_nodes(&[h]);
        assert!(!waiter.is_finished());
        registry.signal_tail_nodes(&[h]);
        waiter.join().unwrap();
    }
}
