//! Fixed-size worker pool draining any number of priority queues.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crate::locks::{SyncCondvar, SyncMutex, SyncRwLock};

use super::{
    Priority,
    task_queue::{ClaimedTask, PrioritisedTaskQueue},
};

/// Wakes idle workers when work arrives.
///
/// Workers read the generation before scanning their queues and only sleep
/// while it is unchanged, so a notify between scan and sleep is never lost.
pub(crate) struct WorkSignal {
    generation: SyncMutex<u64>,
    condvar: SyncCondvar,
}

impl WorkSignal {
    fn new() -> Self {
        Self {
            generation: SyncMutex::new(0),
            condvar: SyncCondvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        *self.generation.lock() += 1;
        self.condvar.notify_one();
    }

    fn notify_all(&self) {
        *self.generation.lock() += 1;
        self.condvar.notify_all();
    }

    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn wait_for_change(&self, observed: u64) {
        let mut generation = self.generation.lock();
        while *generation == observed {
            self.condvar.wait(&mut generation);
        }
    }
}

struct PoolShared {
    name: String,
    queues: SyncRwLock<Vec<PrioritisedTaskQueue>>,
    sequence: Arc<AtomicU64>,
    signal: Arc<WorkSignal>,
    shutdown: AtomicBool,
}

impl PoolShared {
    /// Claims the globally most urgent task across every registered queue.
    fn take_best(&self, min_priority: Priority) -> Option<ClaimedTask> {
        loop {
            let best = {
                let queues = self.queues.read();
                queues
                    .iter()
                    .filter_map(|queue| queue.shared().peek_key().map(|key| (key, queue.clone())))
                    .min_by_key(|(key, _)| *key)
            };
            let ((priority, _), queue) = best?;
            if priority.is_lower_than(min_priority) {
                return None;
            }
            // Another thread may have claimed it in between; rescan then.
            if let Some(task) = queue.shared().take_best(min_priority) {
                return Some(task);
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            let observed = self.signal.generation();
            if let Some(task) = self.take_best(Priority::Idle) {
                task.run();
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.signal.wait_for_change(observed);
        }
    }
}

/// A pool of named worker threads executing tasks from registered queues.
///
/// Each worker repeatedly runs the most urgent task of all queues, breaking
/// ties by global submission order.
pub struct PrioritisedThreadPool {
    shared: Arc<PoolShared>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl PrioritisedThreadPool {
    /// Spawns `threads` workers (at least one).
    pub fn new(name: impl Into<String>, threads: usize) -> io::Result<Self> {
        let name = name.into();
        let shared = Arc::new(PoolShared {
            name: name.clone(),
            queues: SyncRwLock::new(Vec::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            signal: Arc::new(WorkSignal::new()),
            shutdown: AtomicBool::new(false),
        });

        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || shared.worker_loop())?;
            workers.push(handle);
        }
        log::debug!("Started thread pool '{name}' with {threads} workers");

        Ok(Self {
            shared,
            workers: SyncMutex::new(workers),
        })
    }

    /// Registers a new queue drained by this pool's workers.
    #[must_use]
    pub fn create_executor(&self, name: &str) -> PrioritisedTaskQueue {
        let queue = PrioritisedTaskQueue::with_parts(
            format!("{}/{name}", self.shared.name),
            Arc::clone(&self.shared.sequence),
            Some(Arc::clone(&self.shared.signal)),
        );
        self.shared.queues.write().push(queue.clone());
        queue
    }

    /// Number of worker threads still attached to the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Runs one task of priority `min_priority` or better on the calling thread.
    ///
    /// Lets a thread that must not block help drain the pool instead.
    pub fn execute_highest(&self, min_priority: Priority) -> bool {
        match self.shared.take_best(min_priority) {
            Some(task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    /// Total number of queued tasks across all registered queues.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queues.read().iter().map(PrioritisedTaskQueue::len).sum()
    }

    /// Stops the workers once every queued task has run.
    ///
    /// With `wait` the calling thread joins the workers.
    pub fn shutdown(&self, wait: bool) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.signal.notify_all();
        if wait {
            let workers = std::mem::take(&mut *self.workers.lock());
            for worker in workers {
                if worker.join().is_err() {
                    log::error!("Worker of pool '{}' exited abnormally", self.shared.name);
                }
            }
            log::debug!("Thread pool '{}' stopped", self.shared.name);
        }
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for PrioritisedThreadPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}
