//! Runs chunk loads and stage generation off the tick thread.
//!
//! Finished work is not applied by the task itself; every outcome is sent
//! back as a [`TaskResult`] and applied by the holder manager during its tick.

use std::{io, sync::Arc};

use crossbeam::channel::{Receiver, Sender, unbounded};
use steel_utils::{
    ChunkPos,
    concurrent::{
        PrioritisedTaskQueue, PrioritisedThreadPool, Priority, TaskError, TaskHandle,
    },
    locks::SyncMutex,
};

use crate::{
    chunk::{
        chunk_artifact::ChunkArtifact,
        chunk_generator::{ChunkGenerator, ChunkGeneratorType, NeighbourArtifacts},
        chunk_status::ChunkStatus,
    },
    chunk_saver::region_io::{Blob, IoResult, ReadHandle, RegionIoPool},
    error::ChunkError,
};

/// Outcome of background chunk work.
pub(crate) enum TaskResult {
    /// A load finished; `None` means storage had nothing for the chunk.
    Loaded {
        pos: ChunkPos,
        generation: u64,
        result: Result<Option<ChunkArtifact>, ChunkError>,
    },
    /// A stage finished generating.
    Generated {
        pos: ChunkPos,
        generation: u64,
        stage: ChunkStatus,
        result: Result<ChunkArtifact, ChunkError>,
    },
    /// Writing a chunk failed; it must be saved again.
    SaveFailed { pos: ChunkPos, generation: u64 },
}

/// Reports a task's outcome exactly once, even if the task is dropped
/// unrun or unwinds.
struct ResultSender {
    results: Sender<TaskResult>,
    pos: ChunkPos,
    generation: u64,
    stage: Option<ChunkStatus>,
    started: bool,
    sent: bool,
}

impl ResultSender {
    fn new(
        results: Sender<TaskResult>,
        pos: ChunkPos,
        generation: u64,
        stage: Option<ChunkStatus>,
    ) -> Self {
        Self {
            results,
            pos,
            generation,
            stage,
            started: false,
            sent: false,
        }
    }

    fn send(mut self, result: TaskResult) {
        self.sent = true;
        // The receiver only disappears once the chunk system is dropped.
        let _ = self.results.send(result);
    }

    fn send_error(&self, error: ChunkError) {
        let result = match self.stage {
            None => TaskResult::Loaded {
                pos: self.pos,
                generation: self.generation,
                result: Err(error),
            },
            Some(stage) => TaskResult::Generated {
                pos: self.pos,
                generation: self.generation,
                stage,
                result: Err(error),
            },
        };
        let _ = self.results.send(result);
    }
}

impl Drop for ResultSender {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        let error = if self.started {
            let what = self.stage.map_or("load", ChunkStatus::name);
            ChunkError::Task {
                pos: self.pos,
                source: TaskError::Panicked(format!("{what} task did not finish")),
            }
        } else {
            ChunkError::Cancelled { pos: self.pos }
        };
        self.send_error(error);
    }
}

enum DecodeState {
    Reading,
    Decoding(TaskHandle),
    Cancelled,
}

/// Handle of a load: the region read, then the decode on a worker.
#[derive(Clone)]
pub(crate) struct LoadHandle {
    read: ReadHandle,
    decode: Arc<SyncMutex<DecodeState>>,
}

impl LoadHandle {
    fn raise_priority(&self, priority: Priority) -> bool {
        let decoding = match &*self.decode.lock() {
            DecodeState::Decoding(task) => task.raise_priority(priority),
            _ => false,
        };
        self.read.raise_priority(priority) || decoding
    }

    fn set_priority(&self, priority: Priority) -> bool {
        match &*self.decode.lock() {
            DecodeState::Decoding(task) => task.set_priority(priority),
            // The region drain is shared with other ops and only ever raised.
            DecodeState::Reading => self.read.raise_priority(priority),
            DecodeState::Cancelled => false,
        }
    }

    fn cancel(&self) -> bool {
        let mut state = self.decode.lock();
        match std::mem::replace(&mut *state, DecodeState::Cancelled) {
            DecodeState::Reading => {
                // A read already in progress finds the state cancelled and stops there.
                self.read.cancel();
                true
            }
            DecodeState::Decoding(task) => task.cancel(),
            DecodeState::Cancelled => false,
        }
    }
}

/// Handle of the task a holder has in flight.
#[derive(Clone)]
pub(crate) enum ChunkTaskHandle {
    Load(LoadHandle),
    Generation(TaskHandle),
}

impl ChunkTaskHandle {
    /// Moves the task to `priority`.
    pub fn set_priority(&self, priority: Priority) -> bool {
        match self {
            Self::Load(load) => load.set_priority(priority),
            Self::Generation(task) => task.set_priority(priority),
        }
    }

    /// Raises the task to `priority` if that is more urgent.
    pub fn raise_priority(&self, priority: Priority) -> bool {
        match self {
            Self::Load(load) => load.raise_priority(priority),
            Self::Generation(task) => task.raise_priority(priority),
        }
    }

    /// Cancels the task if it has not started; its result then reports
    /// [`ChunkError::Cancelled`].
    pub fn cancel(&self) -> bool {
        match self {
            Self::Load(load) => load.cancel(),
            Self::Generation(task) => task.cancel(),
        }
    }
}

/// Owns the worker pool, the I/O pool and the generator.
pub struct ChunkTaskScheduler {
    pool: PrioritisedThreadPool,
    generation_executor: PrioritisedTaskQueue,
    load_executor: PrioritisedTaskQueue,
    io: RegionIoPool,
    generator: Arc<ChunkGeneratorType>,
    results_tx: Sender<TaskResult>,
    results_rx: Receiver<TaskResult>,
}

impl ChunkTaskScheduler {
    /// Starts `worker_threads` workers.
    pub fn new(
        worker_threads: usize,
        io: RegionIoPool,
        generator: Arc<ChunkGeneratorType>,
    ) -> io::Result<Self> {
        let pool = PrioritisedThreadPool::new("steel-chunk-worker", worker_threads)?;
        let generation_executor = pool.create_executor("generation");
        let load_executor = pool.create_executor("load");
        let (results_tx, results_rx) = unbounded();
        Ok(Self {
            pool,
            generation_executor,
            load_executor,
            io,
            generator,
            results_tx,
            results_rx,
        })
    }

    /// The region I/O pool.
    #[must_use]
    pub fn io(&self) -> &RegionIoPool {
        &self.io
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Number of tasks queued on the worker pool.
    #[must_use]
    pub fn queued_tasks(&self) -> usize {
        self.pool.queued()
    }

    /// Reads the chunk from storage and decodes it on a worker.
    pub(crate) fn schedule_load(
        &self,
        pos: ChunkPos,
        generation: u64,
        priority: Priority,
    ) -> ChunkTaskHandle {
        // Dropped unrun when the read is cancelled, which reports the cancellation.
        let sender = ResultSender::new(self.results_tx.clone(), pos, generation, None);
        let load_executor = self.load_executor.clone();
        let decode = Arc::new(SyncMutex::new(DecodeState::Reading));
        let state = Arc::clone(&decode);
        let read = self.io.schedule_read_with(pos, priority, move |read| match read {
            Ok(Some(blob)) => {
                let mut state = state.lock();
                if matches!(*state, DecodeState::Cancelled) {
                    return;
                }
                let task = load_executor.queue_task(
                    move || {
                        let mut sender = sender;
                        sender.started = true;
                        let result = ChunkArtifact::from_blob(pos, &blob).map(Some);
                        sender.send(TaskResult::Loaded {
                            pos,
                            generation,
                            result,
                        });
                    },
                    priority,
                );
                *state = DecodeState::Decoding(task);
            }
            Ok(None) => sender.send(TaskResult::Loaded {
                pos,
                generation,
                result: Ok(None),
            }),
            Err(source) => sender.send(TaskResult::Loaded {
                pos,
                generation,
                result: Err(ChunkError::Io { pos, source }),
            }),
        });
        ChunkTaskHandle::Load(LoadHandle { read, decode })
    }

    /// Queues generation of `stage` on the worker pool.
    pub(crate) fn schedule_generation(
        &self,
        pos: ChunkPos,
        generation: u64,
        stage: ChunkStatus,
        previous: Option<Arc<ChunkArtifact>>,
        neighbours: NeighbourArtifacts,
        priority: Priority,
    ) -> ChunkTaskHandle {
        let mut sender = ResultSender::new(self.results_tx.clone(), pos, generation, Some(stage));
        let generator = Arc::clone(&self.generator);
        let task = self.generation_executor.queue_task(
            move || {
                sender.started = true;
                let result = generator
                    .generate_stage(pos, stage, previous.as_deref(), &neighbours)
                    .map_err(|error| ChunkError::Generation {
                        pos,
                        stage,
                        error: Arc::new(error),
                    })
                    .and_then(|artifact| {
                        if artifact.pos == pos && artifact.status == stage {
                            Ok(artifact)
                        } else {
                            Err(ChunkError::Corrupt {
                                pos,
                                reason: format!(
                                    "generator returned {:?} at {} for {:?}",
                                    artifact.status, artifact.pos, stage
                                ),
                            })
                        }
                    });
                sender.send(TaskResult::Generated {
                    pos,
                    generation,
                    stage,
                    result,
                });
            },
            priority,
        );
        ChunkTaskHandle::Generation(task)
    }

    /// Writes a chunk blob; failures come back as [`TaskResult::SaveFailed`].
    pub(crate) fn schedule_save(
        &self,
        pos: ChunkPos,
        generation: u64,
        blob: Blob,
        priority: Priority,
    ) {
        let results = self.results_tx.clone();
        self.io
            .schedule_write_with(pos, blob, priority, move |written: IoResult<()>| {
                if written.is_err() {
                    let _ = results.send(TaskResult::SaveFailed { pos, generation });
                }
            });
    }

    /// Every result received so far.
    pub(crate) fn drain_results(&self) -> Vec<TaskResult> {
        self.results_rx.try_iter().collect()
    }

    #[cfg(test)]
    pub(crate) fn inject_result(&self, result: TaskResult) {
        let _ = self.results_tx.send(result);
    }

    /// Runs one queued task on the calling thread.
    pub fn execute_highest(&self, min_priority: Priority) -> bool {
        self.pool.execute_highest(min_priority)
    }

    /// Runs the remaining queued tasks and stops the workers.
    pub fn stop_workers(&self) {
        self.pool.shutdown(true);
    }

    /// Stops the workers, then waits for I/O and flushes storage.
    pub fn shutdown(&self) -> io::Result<()> {
        self.stop_workers();
        self.io.shutdown()
    }
}
