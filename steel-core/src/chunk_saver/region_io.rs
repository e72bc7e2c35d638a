//! Region-batched chunk I/O.
//!
//! Operations are queued per region and each region is drained by at most one
//! I/O task at a time, so operations on one region run in submission order.
//! Data of scheduled writes is cached until it reached storage; reads check
//! that cache first, which makes every write visible to later reads even
//! while it is still queued.

use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use steel_utils::{
    ChunkPos,
    concurrent::{
        Completion, PrioritisedTaskQueue, PrioritisedThreadPool, Priority, ShardedLongMap,
        TaskHandle, completion,
    },
    locks::{SyncCondvar, SyncMutex},
};

use super::storage::ChunkStorage;

/// Cloneable I/O result.
pub type IoResult<T> = Result<T, Arc<io::Error>>;
/// A serialized chunk as handed to storage.
pub type Blob = Arc<[u8]>;

type ReadCallback = Box<dyn FnOnce(IoResult<Option<Blob>>) + Send>;
type WriteCallback = Box<dyn FnOnce(IoResult<()>) + Send>;

enum IoOp {
    Read {
        pos: ChunkPos,
        claimed: Arc<AtomicBool>,
        callback: ReadCallback,
    },
    Write {
        pos: ChunkPos,
        sequence: u64,
        blob: Blob,
        callback: WriteCallback,
    },
}

#[derive(Default)]
struct RegionQueue {
    // Callbacks are only `Send`; the lock makes the queue shareable inside the region map.
    ops: SyncMutex<VecDeque<IoOp>>,
    drain: Option<TaskHandle>,
}

struct IoShared {
    storage: ChunkStorage,
    executor: PrioritisedTaskQueue,
    region_shift: u32,
    regions: ShardedLongMap<RegionQueue>,
    pending_writes: ShardedLongMap<(u64, Blob)>,
    write_sequence: AtomicU64,
    outstanding: SyncMutex<usize>,
    idle: SyncCondvar,
    closed: AtomicBool,
}

impl IoShared {
    /// Appends the op built by `make_op` to its region and returns the
    /// region's drain task.
    ///
    /// `make_op` runs under the region's lock, so ops built for one region
    /// are queued in the order they were built.
    fn enqueue(
        self: &Arc<Self>,
        pos: ChunkPos,
        priority: Priority,
        make_op: impl FnOnce() -> IoOp,
    ) -> TaskHandle {
        *self.outstanding.lock() += 1;
        let region = pos.region_key(self.region_shift);
        self.regions
            .get_or_insert_with(region, RegionQueue::default, |queue| {
                queue.ops.get_mut().push_back(make_op());
                match &queue.drain {
                    Some(handle) => {
                        handle.raise_priority(priority);
                        handle.clone()
                    }
                    None => {
                        let shared = Arc::clone(self);
                        let task = move || shared.drain_region(region);
                        let handle = self.executor.queue_task(task, priority);
                        queue.drain = Some(handle.clone());
                        handle
                    }
                }
            })
    }

    fn drain_region(&self, region: i64) {
        loop {
            let next = self.regions.compute(region, |slot| {
                let queue = slot.as_mut()?;
                let op = queue.ops.get_mut().pop_front();
                if op.is_none() {
                    *slot = None;
                }
                op
            });
            let Some(op) = next else {
                return;
            };
            if panic::catch_unwind(AssertUnwindSafe(|| self.perform(op))).is_err() {
                log::error!("I/O callback panicked while draining region {region:#x}");
            }
            self.finish_op();
        }
    }

    fn perform(&self, op: IoOp) {
        match op {
            IoOp::Read {
                pos,
                claimed,
                callback,
            } => {
                if claimed.swap(true, Ordering::AcqRel) {
                    log::trace!("Skipping cancelled read of chunk {pos}");
                    return;
                }
                let result = self
                    .storage
                    .read_blob(pos)
                    .map(|blob| blob.map(Blob::from))
                    .map_err(|err| {
                        log::error!("Failed to read chunk {pos}: {err}");
                        Arc::new(err)
                    });
                callback(result);
            }
            IoOp::Write {
                pos,
                sequence,
                blob,
                callback,
            } => {
                let result = self.storage.write_blob(pos, &blob);
                match &result {
                    Ok(()) => {
                        self.pending_writes.compute(pos.as_i64(), |slot| {
                            if slot.as_ref().is_some_and(|(latest, _)| *latest == sequence) {
                                *slot = None;
                            }
                        });
                    }
                    Err(err) => log::error!("Failed to write chunk {pos}: {err}"),
                }
                callback(result.map_err(Arc::new));
            }
        }
    }

    fn finish_op(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn closed_error() -> Arc<io::Error> {
        Arc::new(io::Error::other("region i/o pool is shut down"))
    }
}

/// Handle of a scheduled read.
#[derive(Clone)]
pub struct ReadHandle {
    drain: Option<TaskHandle>,
    claimed: Arc<AtomicBool>,
}

impl ReadHandle {
    fn answered() -> Self {
        Self {
            drain: None,
            claimed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Raises the priority of the task draining the read's region.
    ///
    /// The drain serves every queued op of the region, so it is never lowered.
    pub fn raise_priority(&self, priority: Priority) -> bool {
        self.drain
            .as_ref()
            .is_some_and(|drain| drain.raise_priority(priority))
    }

    /// Cancels the read if storage was not touched yet. The callback is then
    /// dropped without being called.
    pub fn cancel(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }
}

/// Thread pool performing chunk reads and writes region by region.
pub struct RegionIoPool {
    shared: Arc<IoShared>,
    pool: PrioritisedThreadPool,
}

impl RegionIoPool {
    /// Starts `threads` I/O threads over `storage`.
    pub fn new(storage: ChunkStorage, threads: usize, region_shift: u32) -> io::Result<Self> {
        let pool = PrioritisedThreadPool::new("steel-region-io", threads.max(1))?;
        let executor = pool.create_executor("region-io");
        Ok(Self {
            shared: Arc::new(IoShared {
                storage,
                executor,
                region_shift,
                regions: ShardedLongMap::with_shift(region_shift, 32),
                pending_writes: ShardedLongMap::with_shift(region_shift, 32),
                write_sequence: AtomicU64::new(0),
                outstanding: SyncMutex::new(0),
                idle: SyncCondvar::new(),
                closed: AtomicBool::new(false),
            }),
            pool,
        })
    }

    /// The storage backend.
    #[must_use]
    pub fn storage(&self) -> &ChunkStorage {
        &self.shared.storage
    }

    /// Reads the blob of `pos` and hands it to `callback`.
    ///
    /// A pending write for `pos` answers the read immediately on the calling thread.
    pub fn schedule_read_with(
        &self,
        pos: ChunkPos,
        priority: Priority,
        callback: impl FnOnce(IoResult<Option<Blob>>) + Send + 'static,
    ) -> ReadHandle {
        if self.shared.closed.load(Ordering::Acquire) {
            callback(Err(IoShared::closed_error()));
            return ReadHandle::answered();
        }
        if let Some((_, blob)) = self.shared.pending_writes.get(pos.as_i64()) {
            callback(Ok(Some(blob)));
            return ReadHandle::answered();
        }
        let claimed = Arc::new(AtomicBool::new(false));
        let op = IoOp::Read {
            pos,
            claimed: Arc::clone(&claimed),
            callback: Box::new(callback),
        };
        let drain = self.shared.enqueue(pos, priority, || op);
        ReadHandle {
            drain: Some(drain),
            claimed,
        }
    }

    /// Writes `blob` for `pos` and reports the outcome to `callback`.
    ///
    /// Writes to one chunk reach storage in the order they were scheduled.
    pub fn schedule_write_with(
        &self,
        pos: ChunkPos,
        blob: Blob,
        priority: Priority,
        callback: impl FnOnce(IoResult<()>) + Send + 'static,
    ) {
        if self.shared.closed.load(Ordering::Acquire) {
            callback(Err(IoShared::closed_error()));
            return;
        }
        let shared = &self.shared;
        shared.enqueue(pos, priority, || {
            let sequence = shared.write_sequence.fetch_add(1, Ordering::Relaxed);
            shared
                .pending_writes
                .insert(pos.as_i64(), (sequence, Arc::clone(&blob)));
            IoOp::Write {
                pos,
                sequence,
                blob,
                callback: Box::new(callback),
            }
        });
    }

    /// Reads the blob of `pos`.
    pub fn schedule_read(
        &self,
        pos: ChunkPos,
        priority: Priority,
    ) -> Completion<IoResult<Option<Blob>>> {
        let (completer, completion) = completion();
        self.schedule_read_with(pos, priority, move |result| completer.complete(result));
        completion
    }

    /// Writes `blob` for `pos`.
    pub fn schedule_write(
        &self,
        pos: ChunkPos,
        blob: Blob,
        priority: Priority,
    ) -> Completion<IoResult<()>> {
        let (completer, completion) = completion();
        self.schedule_write_with(pos, blob, priority, move |result| {
            completer.complete(result);
        });
        completion
    }

    /// Number of writes whose data has not reached storage yet.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.shared.pending_writes.len()
    }

    /// Number of operations queued or running.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.lock()
    }

    /// Blocks until every scheduled operation finished.
    pub fn wait_idle(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
    }

    /// Rejects new operations, waits for queued ones, flushes storage and
    /// stops the I/O threads.
    pub fn shutdown(&self) -> io::Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.wait_idle();
        let flushed = self.shared.storage.flush();
        self.pool.shutdown(true);
        log::debug!("Region I/O pool shut down");
        flushed
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crossbeam::channel::{Receiver, bounded};

    use super::*;
    use crate::chunk_saver::{ram_only::RamOnlyStorage, storage::BlobStorage};

    /// Blocks every write until the test releases it.
    struct GatedStorage {
        inner: RamOnlyStorage,
        gate: Receiver<()>,
    }

    impl BlobStorage for GatedStorage {
        fn read_blob(&self, pos: ChunkPos) -> io::Result<Option<Vec<u8>>> {
            self.inner.read_blob(pos)
        }

        fn write_blob(&self, pos: ChunkPos, blob: &[u8]) -> io::Result<()> {
            self.gate.recv().map_err(io::Error::other)?;
            self.inner.write_blob(pos, blob)
        }
    }

    struct FailingStorage;

    impl BlobStorage for FailingStorage {
        fn read_blob(&self, pos: ChunkPos) -> io::Result<Option<Vec<u8>>> {
            if pos.x < 0 {
                Err(io::Error::other("disk on fire"))
            } else {
                Ok(None)
            }
        }

        fn write_blob(&self, _pos: ChunkPos, _blob: &[u8]) -> io::Result<()> {
            Err(io::Error::other("read only"))
        }
    }

    #[test]
    fn test_read_sees_write_in_flight() {
        let (release, gate) = bounded(0);
        let storage = GatedStorage {
            inner: RamOnlyStorage::new(),
            gate,
        };
        let io = RegionIoPool::new(ChunkStorage::Custom(Arc::new(storage)), 2, 5).expect("pool");
        let pos = ChunkPos::new(1, 2);

        let write = io.schedule_write(pos, Blob::from(&b"hello"[..]), Priority::Normal);
        let read = io.schedule_read(pos, Priority::Normal);
        assert!(!write.is_done());
        let blob = read.wait().expect("resolved").expect("no i/o error");
        assert_eq!(blob.as_deref(), Some(&b"hello"[..]));

        release.send(()).expect("writer waiting");
        write.wait().expect("resolved").expect("written");
        io.wait_idle();
        assert_eq!(io.pending_writes(), 0);
        io.shutdown().expect("flush");
    }

    #[test]
    fn test_later_write_keeps_cache_entry() {
        let (release, gate) = bounded(0);
        let storage = GatedStorage {
            inner: RamOnlyStorage::new(),
            gate,
        };
        let io = RegionIoPool::new(ChunkStorage::Custom(Arc::new(storage)), 1, 5).expect("pool");
        let pos = ChunkPos::new(0, 0);

        let first = io.schedule_write(pos, Blob::from(&b"one"[..]), Priority::Normal);
        let second = io.schedule_write(pos, Blob::from(&b"two"[..]), Priority::Normal);
        release.send(()).expect("first write");
        first.wait().expect("resolved").expect("written");
        // The first write must not evict the newer cached data.
        let read = io.schedule_read(pos, Priority::Normal).wait().expect("resolved");
        assert_eq!(read.expect("ok").as_deref(), Some(&b"two"[..]));

        release.send(()).expect("second write");
        second.wait().expect("resolved").expect("written");
        io.shutdown().expect("flush");
    }

    #[test]
    fn test_failure_only_fails_its_completion() {
        let io = RegionIoPool::new(ChunkStorage::Custom(Arc::new(FailingStorage)), 2, 5)
            .expect("pool");
        let bad = io.schedule_read(ChunkPos::new(-1, 0), Priority::Normal);
        let good = io.schedule_read(ChunkPos::new(1, 0), Priority::Normal);
        let write = io.schedule_write(ChunkPos::new(2, 0), Blob::from(&[1u8][..]), Priority::Low);

        assert!(bad.wait().expect("resolved").is_err());
        assert_eq!(good.wait().expect("resolved").expect("ok"), None);
        assert!(write.wait().expect("resolved").is_err());
        io.wait_idle();
        // Failed writes stay readable from the cache.
        assert_eq!(io.pending_writes(), 1);
        io.shutdown().expect("flush");
    }

    #[test]
    fn test_shutdown_drains_writes() {
        let ram = Arc::new(RamOnlyStorage::new());
        let storage: Arc<dyn BlobStorage> = ram.clone();
        let io = RegionIoPool::new(ChunkStorage::Custom(storage), 2, 5).expect("pool");
        for x in 0..100 {
            io.schedule_write_with(
                ChunkPos::new(x, x * 3),
                Blob::from(vec![x as u8; 16]),
                Priority::Low,
                |_| {},
            );
        }
        io.shutdown().expect("flush");
        assert_eq!(ram.len(), 100);
        assert_eq!(io.outstanding(), 0);

        let rejected = io.schedule_read(ChunkPos::new(0, 0), Priority::Normal);
        assert!(rejected.wait().expect("resolved").is_err());
    }

    #[test]
    fn test_cancelled_read_skips_storage() {
        let (release, gate) = bounded(0);
        let storage = Arc::new(GatedStorage {
            inner: RamOnlyStorage::new(),
            gate,
        });
        let io = RegionIoPool::new(ChunkStorage::Custom(storage.clone()), 1, 5).expect("pool");
        let called = Arc::new(AtomicBool::new(false));

        // The blocked write holds the only I/O thread, so the read stays queued.
        let write = io.schedule_write(ChunkPos::new(0, 0), Blob::from(&b"w"[..]), Priority::Normal);
        let flag = Arc::clone(&called);
        let read = io.schedule_read_with(ChunkPos::new(100, 0), Priority::Normal, move |_| {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(read.cancel());
        assert!(!read.cancel());
        assert!(read.raise_priority(Priority::Highest));

        release.send(()).expect("writer waiting");
        write.wait().expect("resolved").expect("written");
        io.wait_idle();
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(storage.inner.read_count(), 0);

        let done = io.schedule_read(ChunkPos::new(2, 0), Priority::Normal);
        assert_eq!(done.wait().expect("resolved").expect("ok"), None);
        io.shutdown().expect("flush");
    }

    #[test]
    fn test_concurrent_writes_to_one_chunk_land_in_order() {
        let ram = Arc::new(RamOnlyStorage::new());
        let storage: Arc<dyn BlobStorage> = ram.clone();
        let io = RegionIoPool::new(ChunkStorage::Custom(storage), 4, 5).expect("pool");
        let pos = ChunkPos::new(7, 7);

        thread::scope(|scope| {
            for writer in 0..4_u8 {
                let io = &io;
                scope.spawn(move || {
                    for round in 0..250_u8 {
                        let blob = Blob::from(vec![writer, round]);
                        io.schedule_write_with(pos, blob, Priority::Normal, |_| {});
                    }
                });
            }
        });
        io.wait_idle();

        // Only the newest write may clear the cache; an older one landing
        // last would leave it behind.
        assert_eq!(io.pending_writes(), 0);
        assert_eq!(ram.write_count(), 1000);
        io.shutdown().expect("flush");
    }
}
