//! Dependency-aware task execution across a fixed set of OS threads.
//!
//! Work is described as [`Task`]s, optionally grouped into a [`TaskSet`]
//! whose edges express happens-before constraints. A finalized set records
//! each task's indegree against a signal in the shared [`SignalRegistry`];
//! workers wait on their own signal before running and signal their
//! adjacent tasks after. Background tasks bypass the signal mechanism
//! entirely (fire and forget).

mod pool;
mod signal;
mod task;

pub use pool::{ThreadIndexTable, WorkerPool, MAX_THREADS};
pub use signal::{SignalHandle, SignalRegistry};
pub use task::{Task, TaskPriority, TaskSet, TaskSetHandle};
