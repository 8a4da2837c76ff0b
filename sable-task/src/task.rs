use arrayvec::ArrayString;

use crate::signal::{SignalHandle, SignalRegistry};

pub const MAX_TASK_NAME_LEN: usize = 48;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskPriority {
    Normal,
    /// Fire-and-forget: bypasses the signal mechanism entirely.
    Background,
}

/// A unit of work for the pool: a short name, a callable, and the signal
/// bookkeeping filled in at finalization.
pub struct Task {
    name: ArrayString<MAX_TASK_NAME_LEN>,
    priority: TaskPriority,
    func: Box<dyn FnOnce() + Send + 'static>,
    signal: SignalHandle,
    adjacencies: Vec<SignalHandle>,
}

impl Task {
    pub fn new(name: &str, priority: TaskPriority, func: impl FnOnce() + Send + 'static) -> Self {
        let mut short = ArrayString::new();
        let take = name.len().min(MAX_TASK_NAME_LEN);
        // truncate on a char boundary
        let mut end = take;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        short.push_str(&name[..end]);
        Self {
            name: short,
            priority,
            func: Box::new(func),
            signal: SignalHandle::INVALID,
            adjacencies: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn signal_handle(&self) -> SignalHandle {
        self.signal
    }

    pub fn adjacencies(&self) -> &[SignalHandle] {
        &self.adjacencies
    }

    pub(crate) fn run(self) {
        (self.func)();
    }
}

/// Index of a task within one [`TaskSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskSetHandle(pub(crate) u16);

struct PendingTask {
    task: Task,
    indegree: i32,
    /// Outgoing edges as indices into the set.
    adjacent: Vec<u16>,
}

/// A batch of tasks with dependency edges. Must be finalized before
/// submission: finalization allocates signals and records indegrees.
#[derive(Default)]
pub struct TaskSet {
    tasks: Vec<PendingTask>,
    finalized: bool,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn task(&mut self, name: &str, func: impl FnOnce() + Send + 'static) -> TaskSetHandle {
        assert!(!self.finalized, "cannot add tasks to a finalized set");
        assert!(self.tasks.len() < u16::MAX as usize);
        self.tasks.push(PendingTask {
            task: Task::new(name, TaskPriority::Normal, func),
            indegree: 0,
            adjacent: Vec::new(),
        });
        TaskSetHandle(self.tasks.len() as u16 - 1)
    }

    /// Declares that `to` may only start after `from` has finished.
    pub fn add_outgoing_edge(&mut self, from: TaskSetHandle, to: TaskSetHandle) {
        assert!(!self.finalized, "cannot add edges to a finalized set");
        assert_ne!(from, to, "task cannot depend on itself");
        let entry = &mut self.tasks[from.0 as usize];
        debug_assert!(
            !entry.adjacent.contains(&to.0),
            "duplicate edge {} -> {}",
            from.0,
            to.0
        );
        entry.adjacent.push(to.0);
        self.tasks[to.0 as usize].indegree += 1;
    }

    /// Allocates a signal per task and records indegrees against them.
    /// After this the set is immutable and ready for submission.
    pub fn finalize(&mut self, registry: &SignalRegistry) {
        assert!(!self.finalized, "task set finalized twice");
        for entry in &mut self.tasks {
            entry.task.signal = registry.register();
        }
        for i in 0..self.tasks.len() {
            registry.finalized(self.tasks[i].task.signal, self.tasks[i].indegree);
            let adjacent = std::mem::take(&mut self.tasks[i].adjacent);
            let handles: Vec<SignalHandle> = adjacent
                .iter()
                .map(|&t| self.tasks[t as usize].task.signal)
                .collect();
            self.tasks[i].task.adjacencies = handles;
        }
        self.finalized = true;
    }

    pub(crate) fn into_tasks(self) -> Vec<Task> {
        debug_assert!(self.finalized);
        self.tasks.into_iter().map(|entry| entry.task).collect()
    }
}
