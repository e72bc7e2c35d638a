//! Priority-ordered task queue with cancellable, re-prioritisable handles.
//!
//! Tasks are ordered by `(priority, sub_order)`. The sub order is a FIFO
//! sequence number; queues belonging to one thread pool share the sequence so
//! ties are broken in global submission order. Changing a task's priority
//! pushes a fresh heap entry and bumps the task's version; entries whose
//! version no longer matches are discarded when they surface.
//!
//! Lock order is heap, then task.

use std::{
    any::Any,
    cmp::Ordering,
    collections::BinaryHeap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering},
    },
};

use thiserror::Error;

use crate::locks::SyncMutex;

use super::{
    Priority,
    completion::{Completer, Completion, completion},
    thread_pool::WorkSignal,
};

/// Why a task did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task was cancelled before it started.
    #[error("task was cancelled before it started")]
    Cancelled,
    /// The task panicked; carries the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Result delivered through a task's completion.
pub type TaskOutcome = Result<(), TaskError>;

type Runnable = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Queued,
    Executing,
    Done,
    Cancelled,
}

struct TaskSlot {
    state: TaskState,
    priority: Priority,
    version: u64,
    runnable: Option<Runnable>,
    completer: Option<Completer<TaskOutcome>>,
}

struct TaskInner {
    slot: SyncMutex<TaskSlot>,
    completion: Completion<TaskOutcome>,
    queue: Weak<QueueShared>,
}

struct HeapEntry {
    priority: Priority,
    sub_order: u64,
    version: u64,
    task: Arc<TaskInner>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sub_order == other.sub_order
    }
}

impl Eq for HeapEntry {}

// BinaryHeap is a max-heap; urgent priority and earlier sub order must win.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sub_order.cmp(&self.sub_order))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl HeapEntry {
    fn is_live(&self, slot: &TaskSlot) -> bool {
        slot.state == TaskState::Queued && slot.version == self.version
    }
}

pub(super) struct QueueShared {
    name: String,
    heap: SyncMutex<BinaryHeap<HeapEntry>>,
    live: AtomicUsize,
    sequence: Arc<AtomicU64>,
    signal: Option<Arc<WorkSignal>>,
}

impl QueueShared {
    fn notify(&self) {
        if let Some(signal) = &self.signal {
            signal.notify();
        }
    }

    /// Priority and sub order of the best live task, dropping stale heads.
    pub(super) fn peek_key(&self) -> Option<(Priority, u64)> {
        let mut heap = self.heap.lock();
        while let Some(top) = heap.peek() {
            let live = top.is_live(&top.task.slot.lock());
            if live {
                return Some((top.priority, top.sub_order));
            }
            heap.pop();
        }
        None
    }

    /// Claims the best live task whose priority is at least `min_priority`.
    pub(super) fn take_best(&self, min_priority: Priority) -> Option<ClaimedTask> {
        let mut heap = self.heap.lock();
        while let Some(top) = heap.peek() {
            if top.priority.is_lower_than(min_priority) {
                return None;
            }
            let Some(entry) = heap.pop() else {
                break;
            };
            let mut slot = entry.task.slot.lock();
            if !entry.is_live(&slot) {
                continue;
            }
            slot.state = TaskState::Executing;
            let runnable = slot.runnable.take();
            let completer = slot.completer.take();
            drop(slot);
            self.live.fetch_sub(1, AtomicOrdering::AcqRel);
            return Some(ClaimedTask {
                queue_name: self.name.clone(),
                task: Arc::clone(&entry.task),
                runnable,
                completer,
            });
        }
        None
    }
}

/// A task removed from its queue and owned by the thread about to run it.
pub(super) struct ClaimedTask {
    queue_name: String,
    task: Arc<TaskInner>,
    runnable: Option<Runnable>,
    completer: Option<Completer<TaskOutcome>>,
}

impl ClaimedTask {
    pub(super) fn run(self) {
        run_claimed(&self.queue_name, &self.task, self.runnable, self.completer);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run_claimed(
    queue_name: &str,
    task: &TaskInner,
    runnable: Option<Runnable>,
    completer: Option<Completer<TaskOutcome>>,
) {
    let outcome = match runnable {
        Some(runnable) => match panic::catch_unwind(AssertUnwindSafe(runnable)) {
            Ok(()) => Ok(()),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Task on queue '{queue_name}' panicked: {message}");
                Err(TaskError::Panicked(message))
            }
        },
        None => Ok(()),
    };
    task.slot.lock().state = TaskState::Done;
    if let Some(completer) = completer {
        completer.complete(outcome);
    }
}

/// A standalone priority task queue.
///
/// Thread agnostic: any thread may queue or execute tasks. Queues created by
/// a [`super::PrioritisedThreadPool`] are additionally drained by its workers.
#[derive(Clone)]
pub struct PrioritisedTaskQueue {
    shared: Arc<QueueShared>,
}

impl PrioritisedTaskQueue {
    /// Creates a queue that is only drained by explicit `execute_*` calls.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_parts(name.into(), Arc::new(AtomicU64::new(0)), None)
    }

    pub(super) fn with_parts(
        name: String,
        sequence: Arc<AtomicU64>,
        signal: Option<Arc<WorkSignal>>,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name,
                heap: SyncMutex::new(BinaryHeap::new()),
                live: AtomicUsize::new(0),
                sequence,
                signal,
            }),
        }
    }

    pub(super) fn shared(&self) -> &Arc<QueueShared> {
        &self.shared
    }

    /// The queue's name, used in log output.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues a task at the given priority.
    pub fn queue_task<F>(&self, task: F, priority: Priority) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (completer, completion) = completion();
        let inner = Arc::new(TaskInner {
            slot: SyncMutex::new(TaskSlot {
                state: TaskState::Queued,
                priority,
                version: 0,
                runnable: Some(Box::new(task)),
                completer: Some(completer),
            }),
            completion,
            queue: Arc::downgrade(&self.shared),
        });
        {
            let mut heap = self.shared.heap.lock();
            heap.push(HeapEntry {
                priority,
                sub_order: self.shared.sequence.fetch_add(1, AtomicOrdering::Relaxed),
                version: 0,
                task: Arc::clone(&inner),
            });
            self.shared.live.fetch_add(1, AtomicOrdering::AcqRel);
        }
        self.shared.notify();
        TaskHandle { inner }
    }

    /// Runs the most urgent queued task on the calling thread.
    ///
    /// Returns false if the queue was empty.
    pub fn execute_task(&self) -> bool {
        self.execute_task_at_least(Priority::Idle)
    }

    /// Runs the most urgent queued task if its priority is at least `min_priority`.
    pub fn execute_task_at_least(&self, min_priority: Priority) -> bool {
        match self.shared.take_best(min_priority) {
            Some(claimed) => {
                claimed.run();
                true
            }
            None => false,
        }
    }

    /// Priority of the most urgent queued task.
    #[must_use]
    pub fn highest_priority(&self) -> Option<Priority> {
        self.shared.peek_key().map(|(priority, _)| priority)
    }

    /// Number of tasks that are queued and not yet started or cancelled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.live.load(AtomicOrdering::Acquire)
    }

    /// Returns true if no task is waiting to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a queued task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    /// Cancels the task if it has not started yet.
    ///
    /// Returns true if this call prevented the task from running. The closure
    /// is dropped unrun and the completion resolves to [`TaskError::Cancelled`].
    pub fn cancel(&self) -> bool {
        let (runnable, completer) = {
            let mut slot = self.inner.slot.lock();
            if slot.state != TaskState::Queued {
                return false;
            }
            slot.state = TaskState::Cancelled;
            (slot.runnable.take(), slot.completer.take())
        };
        if let Some(queue) = self.inner.queue.upgrade() {
            queue.live.fetch_sub(1, AtomicOrdering::AcqRel);
        }
        drop(runnable);
        if let Some(completer) = completer {
            completer.complete(Err(TaskError::Cancelled));
        }
        true
    }

    /// Runs the task on the calling thread if it has not started yet.
    pub fn execute(&self) -> bool {
        let (runnable, completer) = {
            let mut slot = self.inner.slot.lock();
            if slot.state != TaskState::Queued {
                return false;
            }
            slot.state = TaskState::Executing;
            (slot.runnable.take(), slot.completer.take())
        };
        let queue_name = match self.inner.queue.upgrade() {
            Some(queue) => {
                queue.live.fetch_sub(1, AtomicOrdering::AcqRel);
                queue.name.clone()
            }
            None => String::new(),
        };
        run_claimed(&queue_name, &self.inner, runnable, completer);
        true
    }

    /// Current priority, or `None` once the task started or was cancelled.
    #[must_use]
    pub fn priority(&self) -> Option<Priority> {
        let slot = self.inner.slot.lock();
        (slot.state == TaskState::Queued).then_some(slot.priority)
    }

    /// Sets the priority of a queued task.
    ///
    /// Returns false if the task already started, was cancelled, or already
    /// had this priority.
    pub fn set_priority(&self, priority: Priority) -> bool {
        self.change_priority(|current| (current != priority).then_some(priority))
    }

    /// Raises the priority to `priority` if that is more urgent than the current one.
    pub fn raise_priority(&self, priority: Priority) -> bool {
        self.change_priority(|current| priority.is_higher_than(current).then_some(priority))
    }

    /// Lowers the priority to `priority` if that is less urgent than the current one.
    pub fn lower_priority(&self, priority: Priority) -> bool {
        self.change_priority(|current| priority.is_lower_than(current).then_some(priority))
    }

    fn change_priority(&self, decide: impl FnOnce(Priority) -> Option<Priority>) -> bool {
        let Some(queue) = self.inner.queue.upgrade() else {
            return false;
        };
        {
            let mut heap = queue.heap.lock();
            let mut slot = self.inner.slot.lock();
            if slot.state != TaskState::Queued {
                return false;
            }
            let Some(priority) = decide(slot.priority) else {
                return false;
            };
            slot.priority = priority;
            slot.version += 1;
            let version = slot.version;
            drop(slot);
            heap.push(HeapEntry {
                priority,
                sub_order: queue.sequence.fetch_add(1, AtomicOrdering::Relaxed),
                version,
                task: Arc::clone(&self.inner),
            });
        }
        queue.notify();
        true
    }

    /// Returns true once the task finished running or was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(
            self.inner.slot.lock().state,
            TaskState::Done | TaskState::Cancelled
        )
    }

    /// Completion resolved when the task finishes or is cancelled.
    #[must_use]
    pub fn completion(&self) -> Completion<TaskOutcome> {
        self.inner.completion.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<SyncMutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |id: u32| -> Box<dyn FnOnce() + Send> {
            let log = Arc::clone(&log_clone);
            Box::new(move || log.lock().push(id))
        };
        (log, make)
    }

    #[test]
    fn test_runs_by_priority_then_fifo() {
        let queue = PrioritisedTaskQueue::new("test");
        let (log, make) = recorder();
        queue.queue_task(make(1), Priority::Normal);
        queue.queue_task(make(2), Priority::High);
        queue.queue_task(make(3), Priority::Normal);
        queue.queue_task(make(4), Priority::Blocking);

        while queue.execute_task() {}
        assert_eq!(*log.lock(), vec![4, 2, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_prevents_execution() {
        let queue = PrioritisedTaskQueue::new("test");
        let (log, make) = recorder();
        let handle = queue.queue_task(make(1), Priority::Normal);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(queue.len(), 0);
        assert!(!queue.execute_task());
        assert!(log.lock().is_empty());
        assert_eq!(handle.completion().peek(), Some(Ok(Err(TaskError::Cancelled))));
    }

    #[test]
    fn test_raise_priority_reorders_without_running_twice() {
        let queue = PrioritisedTaskQueue::new("test");
        let (log, make) = recorder();
        queue.queue_task(make(1), Priority::Normal);
        let late = queue.queue_task(make(2), Priority::Low);
        assert!(late.raise_priority(Priority::Highest));
        assert!(!late.raise_priority(Priority::Normal));
        assert_eq!(late.priority(), Some(Priority::Highest));
        assert_eq!(queue.len(), 2);

        while queue.execute_task() {}
        assert_eq!(*log.lock(), vec![2, 1]);
    }

    #[test]
    fn test_lower_priority() {
        let queue = PrioritisedTaskQueue::new("test");
        let (log, make) = recorder();
        let first = queue.queue_task(make(1), Priority::High);
        queue.queue_task(make(2), Priority::Normal);
        assert!(first.lower_priority(Priority::Idle));
        assert!(!first.lower_priority(Priority::Low));

        while queue.execute_task() {}
        assert_eq!(*log.lock(), vec![2, 1]);
    }

    #[test]
    fn test_execute_at_least_respects_threshold() {
        let queue = PrioritisedTaskQueue::new("test");
        let (log, make) = recorder();
        queue.queue_task(make(1), Priority::Low);
        assert!(!queue.execute_task_at_least(Priority::High));
        assert!(queue.execute_task_at_least(Priority::Low));
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_handle_execute_runs_inline_once() {
        let queue = PrioritisedTaskQueue::new("test");
        let (log, make) = recorder();
        let handle = queue.queue_task(make(9), Priority::Idle);
        assert!(handle.execute());
        assert!(!handle.execute());
        assert!(handle.is_done());
        assert_eq!(handle.priority(), None);
        assert!(!queue.execute_task());
        assert_eq!(*log.lock(), vec![9]);
    }

    #[test]
    fn test_panic_is_reported_through_completion() {
        let queue = PrioritisedTaskQueue::new("test");
        let handle = queue.queue_task(|| panic!("boom"), Priority::Normal);
        assert!(queue.execute_task());
        match handle.completion().peek() {
            Some(Ok(Err(TaskError::Panicked(msg)))) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome {other:?}"),
        }
        // Queue still usable afterwards.
        let (log, make) = recorder();
        queue.queue_task(make(5), Priority::Normal);
        assert!(queue.execute_task());
        assert_eq!(*log.lock(), vec![5]);
    }

    #[test]
    fn test_highest_priority_skips_cancelled_head() {
        let queue = PrioritisedTaskQueue::new("test");
        let head = queue.queue_task(|| {}, Priority::Blocking);
        queue.queue_task(|| {}, Priority::Low);
        assert_eq!(queue.highest_priority(), Some(Priority::Blocking));
        head.cancel();
        assert_eq!(queue.highest_priority(), Some(Priority::Low));
    }
}
