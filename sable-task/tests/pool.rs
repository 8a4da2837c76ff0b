//! Ordering and flush semantics of the worker pool.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use sable_task::{SignalRegistry, Task, TaskPriority, TaskSet, ThreadIndexTable, WorkerPool};

fn make_pool(workers: usize) -> (WorkerPool, Arc<SignalRegistry>) {
    let signals = Arc::new(SignalRegistry::new(256));
    let table = Arc::new(ThreadIndexTable::new());
    table.register_current();
    let pool = WorkerPool::new(workers, "test_worker", Arc::clone(&signals), table);
    (pool, signals)
}

#[test]
fn single_task_runs() {
    let (mut pool, signals) = make_pool(2);
    let hits = Arc::new(AtomicU32::new(0));

    let mut set = TaskSet::new();
    let hits2 = Arc::clone(&hits);
    set.task("bump", move || {
        hits2.fetch_add(1, Ordering::Relaxed);
    });
    set.finalize(&signals);
    pool.enqueue_set(set);
    pool.flush();

    assert_eq!(hits.load(Ordering::Relaxed), 1);
    pool.shutdown();
}

#[test]
fn edges_impose_happens_before() {
    let (mut pool, signals) = make_pool(4);

    // a chain a -> b -> c -> d recording its execution order
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut set = TaskSet::new();
    let mut handles = Vec::new();
    for i in 0..4u32 {
        let order = Arc::clone(&order);
        handles.push(set.task("link", move || {
            order.lock().push(i);
        }));
    }
    for pair in handles.windows(2) {
        set.add_outgoing_edge(pair[0], pair[1]);
    }
    set.finalize(&signals);
    pool.enqueue_set(set);
    pool.flush();

    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    pool.shutdown();
}

#[test]
fn diamond_joins_before_tail() {
    let (mut pool, signals) = make_pool(4);

    let mids_done = Arc::new(AtomicU32::new(0));
    let tail_saw = Arc::new(AtomicU32::new(u32::MAX));

    let mut set = TaskSet::new();
    let head = set.task("head", || {});
    let mut mids = Vec::new();
    for _ in 0..8 {
        let mids_done = Arc::clone(&mids_done);
        mids.push(set.task("mid", move || {
            mids_done.fetch_add(1, Ordering::Release);
        }));
    }
    let mids_done2 = Arc::clone(&mids_done);
    let tail_saw2 = Arc::clone(&tail_saw);
    let tail = set.task("tail", move || {
        tail_saw2.store(mids_done2.load(Ordering::Acquire), Ordering::Relaxed);
    });
    for &mid in &mids {
        set.add_outgoing_edge(head, mid);
        set.add_outgoing_edge(mid, tail);
    }
    set.finalize(&signals);
    pool.enqueue_set(set);
    pool.flush();

    // the tail must observe every middle task finished
    assert_eq!(tail_saw.load(Ordering::Relaxed), 8);
    pool.shutdown();
}

#[test]
fn try_flush_reports_and_resets() {
    let (mut pool, signals) = make_pool(2);

    assert!(pool.try_flush(), "empty pool flushes trivially");

    let mut set = TaskSet::new();
    for _ in 0..16 {
        set.task("spin", || std::thread::sleep(std::time::Duration::from_millis(1)));
    }
    set.finalize(&signals);
    pool.enqueue_set(set);

    // loop until the batch drains; try_flush helps from this thread
    while !pool.try_flush() {}
    assert!(pool.try_flush());
    pool.shutdown();
}

#[test]
fn background_tasks_run_without_signals() {
    let (mut pool, _signals) = make_pool(2);
    let hits = Arc::new(AtomicU32::new(0));

    for _ in 0..4 {
        let hits = Arc::clone(&hits);
        pool.enqueue(Task::new("bg", TaskPriority::Background, move || {
            hits.fetch_add(1, Ordering::Relaxed);
        }));
    }
    pool.flush();
    assert_eq!(hits.load(Ordering::Relaxed), 4);
    pool.shutdown();
}

#[test]
fn signal_slots_are_recycled_across_batches() {
    let (mut pool, signals) = make_pool(2);

    for _ in 0..32 {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut set = TaskSet::new();
        let mut prev = None;
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let h = set.task("step", move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            if let Some(p) = prev {
                set.add_outgoing_edge(p, h);
            }
            prev = Some(h);
        }
        set.finalize(&signals);
        pool.enqueue_set(set);
        pool.flush();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
    }
    pool.shutdown();
}

#[test]
fn thread_table_indexes_are_stable() {
    let table = Arc::new(ThreadIndexTable::new());
    let main_idx = table.register_current();
    assert_eq!(main_idx, 0);
    assert_eq!(table.current_index(), 0);

    let signals = Arc::new(SignalRegistry::new(64));
    let mut pool = WorkerPool::new(3, "idx_worker", signals.clone(), Arc::clone(&table));

    let seen = Arc::new(parking_lot::Mutex::new(std::collections::BTreeSet::new()));
    let mut set = TaskSet::new();
    for _ in 0..3 {
        let table = Arc::clone(&table);
        let seen = Arc::clone(&seen);
        set.task("who", move || {
            // repeated lookups from the same thread are stable
            let idx = table.current_index();
            assert_eq!(table.current_index(), idx);
            seen.lock().insert(idx);
            std::thread::sleep(std::time::Duration::from_millis(5));
        });
    }
    set.finalize(&signals);
    pool.enqueue_set(set);
    // main is registered (index 0), so helping from here is fine too
    pool.flush();

    let seen = seen.lock();
    for &idx in seen.iter() {
        assert!(idx < table.len());
    }
    pool.shutdown();
}

/// Registration and lookup overlap freely: threads still registering never
/// stall threads that already hold an index.
#[test]
fn thread_table_lookups_proceed_during_registration() {
    const THREADS: usize = 8;
    let table = Arc::new(ThreadIndexTable::new());

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                let idx = table.register_current();
                // hammer lookups while siblings are mid-registration
                for _ in 0..1000 {
                    assert_eq!(table.current_index(), idx);
                }
                idx
            })
        })
        .collect();

    let mut indexes: Vec<usize> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    indexes.sort_unstable();
    indexes.dedup();
    assert_eq!(indexes.len(), THREADS, "indexes must be unique");
    assert_eq!(table.len(), THREADS);
    assert!(indexes.iter().all(|&idx| idx < THREADS));
}
