//! Drives chunk holders from ticket levels.
//!
//! One tick runs, in order: ticket expiry, level propagation, application of
//! finished background work, holder advancement, unloading and autosave.
//! Every stage field of a holder is only written here, on the thread that
//! ticks; other threads only add requests.

use std::{
    collections::BTreeSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use rustc_hash::FxHashSet;
use steel_utils::{
    ChunkPos,
    concurrent::{Cancelled, Completion, Priority, ShardedLongMap, completion},
    locks::{SyncMutex, SyncRwLock},
};

use crate::{
    chunk::{
        chunk_artifact::ChunkArtifact,
        chunk_generator::{ChunkGeneratorType, NeighbourArtifacts},
        chunk_holder::{ChunkFuture, ChunkHolder, InFlight, Waiter},
        chunk_level::ChunkLevel,
        chunk_status::ChunkStatus,
        chunk_task_scheduler::{ChunkTaskScheduler, TaskResult},
        level_propagator::LevelChange,
        ticket::TicketType,
        ticket_manager::TicketManager,
    },
    chunk_saver::{
        region_io::{Blob, RegionIoPool},
        storage::ChunkStorage,
    },
    config::ChunkSystemConfig,
    error::ChunkError,
    queue::unload_queue::ChunkUnloadQueue,
};

/// Observer of holder changes, called on the ticking thread.
///
/// Callbacks must not tick or block on the chunk system.
pub trait ChunkListener: Send + Sync {
    /// The propagated level of `pos` changed.
    fn on_level_change(&self, _pos: ChunkPos, _old_level: u8, _new_level: u8) {}
    /// `pos` completed `status`, by generation or by loading.
    fn on_stage_change(&self, _pos: ChunkPos, _status: ChunkStatus) {}
    /// The holder of `pos` was dropped.
    fn on_unload(&self, _pos: ChunkPos) {}
}

enum Step {
    Idle,
    Deferred,
    Unload,
    Release(Vec<(ChunkPos, u8)>),
    Load {
        generation: u64,
        priority: Priority,
    },
    Generate {
        generation: u64,
        stage: ChunkStatus,
        previous: Option<Arc<ChunkArtifact>>,
        priority: Priority,
    },
}

enum Advanced {
    Started,
    Deferred,
    Nothing,
}

enum Neighbours {
    Ready(NeighbourArtifacts),
    Waiting,
    Failed(ChunkPos),
}

enum Applied {
    Stale,
    Missing,
    Completed {
        artifact: Arc<ChunkArtifact>,
        waiters: Vec<(ChunkStatus, Waiter)>,
        autosave_at: Option<u64>,
        released: Vec<(ChunkPos, u8)>,
    },
    Failed {
        error: ChunkError,
        waiters: Vec<(ChunkStatus, Waiter)>,
        released: Vec<(ChunkPos, u8)>,
    },
}

/// Ticket id used for tickets a chunk places for itself or on its neighbours.
fn ticket_id(pos: ChunkPos) -> u64 {
    pos.as_i64() as u64
}

/// Owns every chunk holder and turns ticket levels into chunk work.
pub struct ChunkHolderManager {
    config: ChunkSystemConfig,
    tickets: TicketManager,
    holders: ShardedLongMap<ChunkHolder>,
    scheduler: ChunkTaskScheduler,
    unload_queue: ChunkUnloadQueue,
    pending: SyncMutex<FxHashSet<i64>>,
    autosave: SyncMutex<BTreeSet<(u64, i64)>>,
    listeners: SyncRwLock<Vec<Arc<dyn ChunkListener>>>,
    next_generation: AtomicU64,
    current_tick: AtomicU64,
    tick_lock: SyncMutex<()>,
    closed: AtomicBool,
}

impl ChunkHolderManager {
    /// Starts the worker and I/O pools.
    pub fn new(
        config: ChunkSystemConfig,
        storage: ChunkStorage,
        generator: ChunkGeneratorType,
    ) -> io::Result<Self> {
        config
            .validate()
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        let io = RegionIoPool::new(storage, config.io_threads, config.region_shift)?;
        let scheduler =
            ChunkTaskScheduler::new(config.resolved_worker_threads(), io, Arc::new(generator))?;
        log::info!(
            "Chunk system started with {} workers and {} I/O threads",
            scheduler.worker_count(),
            config.io_threads
        );
        Ok(Self {
            tickets: TicketManager::new(
                config.propagation_step_cost,
                config.region_shift,
                config.map_stripes,
            ),
            holders: ShardedLongMap::with_shift(config.region_shift, config.map_stripes),
            scheduler,
            unload_queue: ChunkUnloadQueue::new(config.region_shift),
            pending: SyncMutex::new(FxHashSet::default()),
            autosave: SyncMutex::new(BTreeSet::new()),
            listeners: SyncRwLock::new(Vec::new()),
            next_generation: AtomicU64::new(1),
            current_tick: AtomicU64::new(0),
            tick_lock: SyncMutex::new(()),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// The ticket manager.
    #[must_use]
    pub fn tickets(&self) -> &TicketManager {
        &self.tickets
    }

    /// The region I/O pool.
    #[must_use]
    pub fn io(&self) -> &RegionIoPool {
        self.scheduler.io()
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn ChunkListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, f: impl Fn(&dyn ChunkListener)) {
        for listener in self.listeners.read().iter() {
            f(listener.as_ref());
        }
    }

    fn mark_pending(&self, key: i64) {
        self.pending.lock().insert(key);
    }

    fn mark_area_pending(&self, pos: ChunkPos) {
        let mut pending = self.pending.lock();
        pending.insert(pos.as_i64());
        pending.extend(pos.neighbours().iter().map(|neighbour| neighbour.as_i64()));
    }

    /// The tick counter.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    /// Runs one tick.
    ///
    /// Only one thread ticks at a time; a concurrent call returns without doing anything.
    pub fn tick(&self) {
        let Some(_guard) = self.tick_lock.try_lock() else {
            log::warn!("Chunk system tick skipped, another thread is ticking");
            return;
        };
        let tick = self.current_tick.fetch_add(1, Ordering::AcqRel) + 1;
        for pos in self.tickets.tick(tick) {
            self.mark_pending(pos.as_i64());
        }
        self.process_ticket_updates();
        self.process_task_results();
        self.advance_pending();
        self.process_unloads();
        self.autosave(tick);
    }

    fn process_ticket_updates(&self) {
        for change in self.tickets.run_pending_updates() {
            self.apply_level_change(change);
        }
    }

    fn apply_level_change(&self, change: LevelChange) {
        let pos = change.pos;
        let key = pos.as_i64();
        let target = ChunkLevel::generation_status(change.new_level);
        let applied = self.holders.compute(key, |slot| {
            if slot.is_none() {
                if target.is_none() {
                    return None;
                }
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                *slot = Some(ChunkHolder::new(pos, generation, change.new_level));
            }
            let holder = slot.as_mut()?;
            holder.ticket_level = change.new_level;
            holder.target = target;
            let dequeue = target.is_some() && std::mem::take(&mut holder.in_unload_queue);
            let handle = holder
                .in_flight
                .as_ref()
                .and_then(|task| task.handle.clone());
            let priority = ChunkLevel::priority(change.new_level, !holder.waiters.is_empty());
            Some((dequeue, handle, priority))
        });

        if let Some((dequeue, handle, priority)) = applied {
            if dequeue {
                self.unload_queue.remove_chunk(pos);
            }
            if let Some(handle) = handle {
                handle.set_priority(priority);
            }
            self.mark_pending(key);
        }
        self.notify(|listener| listener.on_level_change(pos, change.old_level, change.new_level));
    }

    /// Applies every finished load, generation and failed save.
    pub(crate) fn process_task_results(&self) {
        for result in self.scheduler.drain_results() {
            match result {
                TaskResult::Loaded {
                    pos,
                    generation,
                    result,
                } => self.apply_loaded(pos, generation, result),
                TaskResult::Generated {
                    pos,
                    generation,
                    stage,
                    result,
                } => self.apply_generated(pos, generation, stage, result),
                TaskResult::SaveFailed { pos, generation } => {
                    let tick = self.current_tick();
                    let autosave_at = self
                        .holders
                        .update(pos.as_i64(), |holder| {
                            if holder.generation != generation {
                                return None;
                            }
                            holder.unsaved = true;
                            self.schedule_autosave(holder, tick)
                        })
                        .flatten();
                    if let Some(due) = autosave_at {
                        self.autosave.lock().insert((due, pos.as_i64()));
                    }
                }
            }
        }
    }

    fn schedule_autosave(&self, holder: &mut ChunkHolder, tick: u64) -> Option<u64> {
        if holder.autosave_at.is_some() {
            return None;
        }
        let due = tick + self.config.autosave_interval_ticks;
        holder.autosave_at = Some(due);
        Some(due)
    }

    fn apply_loaded(
        &self,
        pos: ChunkPos,
        generation: u64,
        result: Result<Option<ChunkArtifact>, ChunkError>,
    ) {
        let tick = self.current_tick();
        let applied = self
            .holders
            .update(pos.as_i64(), |holder| {
                let loading = holder
                    .in_flight
                    .as_ref()
                    .is_some_and(|task| task.stage.is_none());
                if holder.generation != generation || !loading {
                    return Applied::Stale;
                }
                holder.in_flight = None;
                match result {
                    Ok(Some(artifact)) => {
                        holder.load_attempted = true;
                        let artifact = Arc::new(artifact);
                        holder.current = Some(artifact.status);
                        holder.artifact = Some(Arc::clone(&artifact));
                        holder.unsaved = false;
                        holder.last_save_tick = tick;
                        let waiters = holder.take_waiters_up_to(artifact.status);
                        let released = if holder.target.is_none_or(|t| holder.has_reached(t)) {
                            std::mem::take(&mut holder.dependency_tickets)
                        } else {
                            Vec::new()
                        };
                        Applied::Completed {
                            artifact,
                            waiters,
                            autosave_at: None,
                            released,
                        }
                    }
                    Ok(None) => {
                        holder.load_attempted = true;
                        Applied::Missing
                    }
                    Err(error) => {
                        holder.failed = Some(ChunkStatus::Empty);
                        Applied::Failed {
                            error,
                            waiters: holder.take_all_waiters(),
                            released: std::mem::take(&mut holder.dependency_tickets),
                        }
                    }
                }
            })
            .unwrap_or(Applied::Stale);
        self.finish_applied(pos, applied, "load");
    }

    fn apply_generated(
        &self,
        pos: ChunkPos,
        generation: u64,
        stage: ChunkStatus,
        result: Result<ChunkArtifact, ChunkError>,
    ) {
        let tick = self.current_tick();
        let applied = self
            .holders
            .update(pos.as_i64(), |holder| {
                let running = holder
                    .in_flight
                    .as_ref()
                    .is_some_and(|task| task.stage == Some(stage));
                if holder.generation != generation || !running {
                    return Applied::Stale;
                }
                holder.in_flight = None;
                match result {
                    Ok(artifact) => {
                        let artifact = Arc::new(artifact);
                        holder.current = Some(stage);
                        holder.artifact = Some(Arc::clone(&artifact));
                        holder.unsaved = true;
                        let autosave_at = self.schedule_autosave(holder, tick);
                        let waiters = holder.take_waiters_up_to(stage);
                        let released = if stage == ChunkStatus::Full {
                            std::mem::take(&mut holder.dependency_tickets)
                        } else {
                            Vec::new()
                        };
                        Applied::Completed {
                            artifact,
                            waiters,
                            autosave_at,
                            released,
                        }
                    }
                    Err(error) => {
                        holder.failed = Some(stage);
                        Applied::Failed {
                            error,
                            waiters: holder.take_all_waiters(),
                            released: std::mem::take(&mut holder.dependency_tickets),
                        }
                    }
                }
            })
            .unwrap_or(Applied::Stale);
        self.finish_applied(pos, applied, stage.name());
    }

    fn finish_applied(&self, pos: ChunkPos, applied: Applied, what: &str) {
        match applied {
            Applied::Stale => {
                log::debug!("Discarding stale {what} result for chunk {pos}");
            }
            Applied::Missing => self.mark_pending(pos.as_i64()),
            Applied::Completed {
                artifact,
                waiters,
                autosave_at,
                released,
            } => {
                if let Some(due) = autosave_at {
                    self.autosave.lock().insert((due, pos.as_i64()));
                }
                self.release_dependencies(pos, released);
                self.resolve_waiters(pos, waiters, &Ok(Arc::clone(&artifact)));
                self.notify(|listener| listener.on_stage_change(pos, artifact.status));
                self.mark_area_pending(pos);
            }
            Applied::Failed {
                error,
                waiters,
                released,
            } => {
                log::warn!("Chunk {pos} failed: {error}");
                self.release_dependencies(pos, released);
                self.resolve_waiters(pos, waiters, &Err(error));
                // Neighbours waiting on this chunk must see the failure.
                self.mark_area_pending(pos);
            }
        }
    }

    fn resolve_waiters(
        &self,
        pos: ChunkPos,
        waiters: Vec<(ChunkStatus, Waiter)>,
        result: &Result<Arc<ChunkArtifact>, ChunkError>,
    ) {
        for (status, waiter) in waiters {
            waiter.completer.complete(result.clone());
            // Ticket errors are logged by the ticket manager.
            let _ = self.tickets.remove_ticket(
                TicketType::CHUNK_LOAD,
                pos,
                ChunkLevel::by_status(status),
                ticket_id(pos),
            );
        }
    }

    fn release_dependencies(&self, pos: ChunkPos, tickets: Vec<(ChunkPos, u8)>) {
        for (neighbour, level) in tickets {
            let _ = self.tickets.remove_ticket(
                TicketType::GENERATION_DEPENDENCY,
                neighbour,
                level,
                ticket_id(pos),
            );
        }
    }

    fn advance_pending(&self) {
        let keys: Vec<i64> = self.pending.lock().drain().collect();
        if keys.is_empty() {
            return;
        }
        let mut ordered: Vec<(u8, i64)> = keys
            .into_iter()
            .filter_map(|key| {
                self.holders
                    .with(key, |holder| holder.ticket_level)
                    .map(|level| (level, key))
            })
            .collect();
        ordered.sort_unstable();

        let mut budget = self.config.max_stage_tasks_per_tick;
        let mut deferred = Vec::new();
        for (_, key) in ordered {
            match self.advance(key, budget > 0) {
                Advanced::Started => budget -= 1,
                Advanced::Deferred => deferred.push(key),
                Advanced::Nothing => {}
            }
        }
        if !deferred.is_empty() {
            log::trace!("{} chunks wait for the next tick", deferred.len());
            self.pending.lock().extend(deferred);
        }
    }

    /// Moves one holder forward.
    fn advance(&self, key: i64, can_start: bool) -> Advanced {
        let pos = ChunkPos::from_i64(key);
        let cooling_down = self.tickets.has_ticket_type(pos, TicketType::UNLOAD_COOLDOWN);
        let step = self
            .holders
            .update(key, |holder| Self::next_step(holder, can_start, cooling_down))
            .unwrap_or(Step::Idle);
        match step {
            Step::Idle => Advanced::Nothing,
            Step::Deferred => Advanced::Deferred,
            Step::Unload => {
                self.unload_queue.add_chunk(pos);
                Advanced::Nothing
            }
            Step::Release(tickets) => {
                self.release_dependencies(pos, tickets);
                Advanced::Nothing
            }
            Step::Load {
                generation,
                priority,
            } => {
                let handle = self.scheduler.schedule_load(pos, generation, priority);
                self.holders.update(key, |holder| {
                    if let Some(task) = &mut holder.in_flight
                        && holder.generation == generation
                        && task.stage.is_none()
                    {
                        task.handle = Some(handle);
                    }
                });
                Advanced::Started
            }
            Step::Generate {
                generation,
                stage,
                previous,
                priority,
            } => match self.collect_neighbours(pos, stage, previous.clone()) {
                Neighbours::Ready(neighbours) => {
                    let handle = self.scheduler.schedule_generation(
                        pos, generation, stage, previous, neighbours, priority,
                    );
                    self.holders.update(key, |holder| {
                        if holder.generation == generation {
                            holder.in_flight = Some(InFlight {
                                stage: Some(stage),
                                handle: Some(handle),
                            });
                        }
                    });
                    Advanced::Started
                }
                Neighbours::Waiting => Advanced::Nothing,
                Neighbours::Failed(neighbour) => {
                    self.fail_for_neighbour(pos, generation, stage, neighbour);
                    Advanced::Nothing
                }
            },
        }
    }

    /// Fails every request of `pos` because `neighbour` can no longer reach
    /// the stage `stage` reads.
    fn fail_for_neighbour(
        &self,
        pos: ChunkPos,
        generation: u64,
        stage: ChunkStatus,
        neighbour: ChunkPos,
    ) {
        let failed = self
            .holders
            .update(pos.as_i64(), |holder| {
                if holder.generation != generation {
                    return None;
                }
                holder.failed = Some(stage);
                Some((
                    holder.take_all_waiters(),
                    std::mem::take(&mut holder.dependency_tickets),
                ))
            })
            .flatten();
        if let Some((waiters, released)) = failed {
            self.finish_applied(
                pos,
                Applied::Failed {
                    error: ChunkError::NeighbourFailed {
                        pos,
                        stage,
                        neighbour,
                    },
                    waiters,
                    released,
                },
                stage.name(),
            );
        }
    }

    fn next_step(holder: &mut ChunkHolder, can_start: bool, cooling_down: bool) -> Step {
        if holder.in_flight.is_some() {
            return Step::Idle;
        }
        let Some(target) = holder.target else {
            if holder.is_safe_to_unload() && !holder.in_unload_queue && !cooling_down {
                holder.in_unload_queue = true;
                return Step::Unload;
            }
            return Step::Idle;
        };
        if holder.has_reached(target) {
            if holder.dependency_tickets.is_empty() {
                return Step::Idle;
            }
            return Step::Release(std::mem::take(&mut holder.dependency_tickets));
        }
        if holder.failed.is_some() {
            return Step::Idle;
        }
        if !can_start {
            return Step::Deferred;
        }
        let priority = ChunkLevel::priority(holder.ticket_level, !holder.waiters.is_empty());
        if !holder.load_attempted {
            holder.in_flight = Some(InFlight {
                stage: None,
                handle: None,
            });
            return Step::Load {
                generation: holder.generation,
                priority,
            };
        }
        let stage = match holder.current {
            None => ChunkStatus::Empty,
            Some(current) => match current.next() {
                Some(next) => next,
                None => return Step::Idle,
            },
        };
        Step::Generate {
            generation: holder.generation,
            stage,
            previous: holder.artifact.clone(),
            priority,
        }
    }

    /// Gathers the neighbours `stage` reads, or places dependency tickets on
    /// the ones whose target is too low and reports that the stage must wait.
    fn collect_neighbours(
        &self,
        pos: ChunkPos,
        stage: ChunkStatus,
        own: Option<Arc<ChunkArtifact>>,
    ) -> Neighbours {
        let radius = stage.neighbour_radius();
        let Some(required) = stage.previous().filter(|_| radius > 0) else {
            return Neighbours::Ready(NeighbourArtifacts::none(pos));
        };
        let mut artifacts = Vec::with_capacity(NeighbourArtifacts::area(radius));
        let mut ready = true;
        let mut too_low = Vec::new();
        for neighbour in pos.square(i32::from(radius)) {
            if neighbour == pos {
                artifacts.push(own.clone());
                continue;
            }
            let state = self.holders.with(neighbour.as_i64(), |holder| {
                (
                    holder.current,
                    holder.artifact.clone(),
                    holder.target,
                    holder.failed.is_some(),
                )
            });
            match state {
                Some((Some(current), artifact, _, _)) if current >= required => {
                    artifacts.push(artifact);
                }
                Some((_, _, _, true)) => return Neighbours::Failed(neighbour),
                Some((_, _, Some(target), _)) if target >= required => {
                    ready = false;
                    artifacts.push(None);
                }
                _ => {
                    ready = false;
                    too_low.push(neighbour);
                    artifacts.push(None);
                }
            }
        }

        if !too_low.is_empty() {
            let level = ChunkLevel::by_status(required);
            let placed = self
                .holders
                .update(pos.as_i64(), |holder| {
                    let mut placed = Vec::new();
                    for neighbour in too_low {
                        if !holder.dependency_tickets.iter().any(|(p, _)| *p == neighbour) {
                            holder.dependency_tickets.push((neighbour, level));
                            placed.push(neighbour);
                        }
                    }
                    placed
                })
                .unwrap_or_default();
            for neighbour in placed {
                log::trace!("Chunk {pos} waits for {neighbour} to reach {}", required.name());
                let _ = self.tickets.add_ticket(
                    TicketType::GENERATION_DEPENDENCY,
                    neighbour,
                    level,
                    ticket_id(pos),
                );
            }
        }
        if ready {
            Neighbours::Ready(NeighbourArtifacts::new(pos, radius, artifacts))
        } else {
            Neighbours::Waiting
        }
    }

    fn process_unloads(&self) {
        let queued = self.unload_queue.len();
        if queued == 0 {
            return;
        }
        let by_fraction = (queued as f64 * self.config.unload_fraction) as usize;
        let mut budget = self.config.unload_min_batch.max(by_fraction);
        let mut unloaded = 0;
        for section in self.unload_queue.retrieve_for_all_regions() {
            if budget == 0 {
                break;
            }
            let chunks = self
                .unload_queue
                .drain_section(section.section_x, section.section_z, budget);
            budget -= chunks.len();
            for pos in chunks {
                if self.unload(pos) {
                    unloaded += 1;
                }
            }
        }
        if unloaded > 0 {
            log::debug!("Unloaded {unloaded} of {queued} queued chunks");
        }
    }

    fn unload(&self, pos: ChunkPos) -> bool {
        let removed = self.holders.compute(pos.as_i64(), |slot| {
            let holder = slot.as_mut()?;
            holder.in_unload_queue = false;
            if !holder.is_safe_to_unload() {
                return Some(None);
            }
            Some(slot.take())
        });
        let mut holder = match removed {
            None => return false,
            Some(None) => {
                // Picked up again since it was queued; wait before the next attempt.
                log::trace!("Chunk {pos} is in use again, delaying its unload");
                let _ = self.tickets.add_ticket(
                    TicketType::UNLOAD_COOLDOWN,
                    pos,
                    ChunkLevel::MAX_LEVEL,
                    ticket_id(pos),
                );
                return false;
            }
            Some(Some(holder)) => holder,
        };
        if holder.unsaved
            && let Some(artifact) = &holder.artifact
        {
            self.scheduler.schedule_save(
                pos,
                holder.generation,
                Blob::from(artifact.to_blob()),
                Priority::Normal,
            );
        }
        self.release_dependencies(pos, std::mem::take(&mut holder.dependency_tickets));
        self.notify(|listener| listener.on_unload(pos));
        true
    }

    fn autosave(&self, tick: u64) {
        let mut saved = 0;
        while saved < self.config.autosave_max_per_tick {
            let due = {
                let mut autosave = self.autosave.lock();
                match autosave.first() {
                    Some(&(due, key)) if due <= tick => {
                        autosave.pop_first();
                        Some((due, key))
                    }
                    _ => None,
                }
            };
            let Some((due, key)) = due else {
                break;
            };
            if self.save_holder(key, Some(due), Priority::Low) {
                saved += 1;
            }
        }
        if saved > 0 {
            log::debug!("Autosaved {saved} chunks");
        }
    }

    /// Writes the holder if it has unsaved data. With `due`, only if that
    /// autosave is still the holder's current one.
    fn save_holder(&self, key: i64, due: Option<u64>, priority: Priority) -> bool {
        let tick = self.current_tick();
        let job = self
            .holders
            .update(key, |holder| {
                if due.is_some() && holder.autosave_at != due {
                    return None;
                }
                holder.autosave_at = None;
                if !holder.unsaved {
                    return None;
                }
                let blob = Blob::from(holder.artifact.as_ref()?.to_blob());
                holder.unsaved = false;
                holder.last_save_tick = tick;
                Some((holder.generation, blob))
            })
            .flatten();
        match job {
            Some((generation, blob)) => {
                self.scheduler
                    .schedule_save(ChunkPos::from_i64(key), generation, blob, priority);
                true
            }
            None => false,
        }
    }

    /// Requests `pos` at `stage` or beyond.
    ///
    /// Safe from any thread. Concurrent requests for the same stage share one
    /// future. Each distinct request holds a load ticket until it resolves.
    pub fn get_or_load_chunk(&self, pos: ChunkPos, stage: ChunkStatus) -> ChunkFuture {
        if self.closed.load(Ordering::Acquire) {
            return Completion::ready(Err(ChunkError::ShuttingDown));
        }
        let key = pos.as_i64();
        let (future, new_request, handle) = self.holders.get_or_insert_with(
            key,
            || {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                ChunkHolder::new(pos, generation, ChunkLevel::MAX_LEVEL)
            },
            |holder| {
                if holder.has_reached(stage)
                    && let Some(artifact) = &holder.artifact
                {
                    return (Completion::ready(Ok(Arc::clone(artifact))), false, None);
                }
                holder.failed = None;
                let handle = holder
                    .in_flight
                    .as_ref()
                    .and_then(|task| task.handle.clone());
                if let Some(waiter) = holder.waiters.get(&stage) {
                    return (waiter.completion.clone(), false, handle);
                }
                let (completer, completion) = completion();
                holder.waiters.insert(
                    stage,
                    Waiter {
                        completer,
                        completion: completion.clone(),
                    },
                );
                (completion, true, handle)
            },
        );
        if let Some(handle) = handle {
            handle.raise_priority(ChunkLevel::priority(0, true));
        }
        if new_request {
            // Retry failed neighbours too, the chunk may need to read them.
            for neighbour in pos.neighbours() {
                self.holders
                    .update(neighbour.as_i64(), |holder| holder.failed = None);
            }
            let _ = self.tickets.add_ticket(
                TicketType::CHUNK_LOAD,
                pos,
                ChunkLevel::by_status(stage),
                ticket_id(pos),
            );
            self.mark_area_pending(pos);
        }
        future
    }

    /// Raises the priority of the task running for `pos`.
    pub fn raise_priority(&self, pos: ChunkPos, priority: Priority) -> bool {
        self.holders
            .with(pos.as_i64(), |holder| {
                holder.in_flight.as_ref().and_then(|task| task.handle.clone())
            })
            .flatten()
            .is_some_and(|handle| handle.raise_priority(priority))
    }

    /// Waits for `completion` without stalling the chunk system.
    ///
    /// Keeps applying ticket changes and finished work, and runs queued
    /// tasks on the calling thread while waiting. Must not be called from a
    /// listener or a task.
    pub fn block_on<T: Clone>(&self, completion: &Completion<T>) -> Result<T, Cancelled> {
        loop {
            if let Some(result) = completion.peek() {
                return result;
            }
            {
                let _guard = self.tick_lock.lock();
                self.process_ticket_updates();
                self.process_task_results();
                self.advance_pending();
            }
            if let Some(result) = completion.peek() {
                return result;
            }
            if !self.scheduler.execute_highest(Priority::Idle) {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Writes every chunk with unsaved data. With `flush`, also waits for
    /// the writes and flushes storage.
    pub fn save_all(&self, flush: bool) -> io::Result<()> {
        let mut saved = 0;
        for key in self.holders.keys() {
            if self.save_holder(key, None, Priority::Normal) {
                saved += 1;
            }
        }
        log::info!("Saving {saved} chunks");
        if flush {
            self.io().wait_idle();
            self.io().storage().flush()?;
        }
        Ok(())
    }

    /// Stops the chunk system. Running tasks are cancelled; with `save`,
    /// unsaved chunks are written before the I/O pool drains.
    pub fn close(&self, save: bool) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.tick_lock.lock();
        log::info!("Closing chunk system with {} chunks", self.holders.len());
        self.holders.for_each(|_, holder| {
            if let Some(handle) = holder.in_flight.as_ref().and_then(|task| task.handle.as_ref()) {
                handle.cancel();
            }
        });
        self.scheduler.stop_workers();
        self.process_task_results();
        if save {
            self.save_all(false)?;
        }
        let flushed = self.scheduler.shutdown();

        let mut waiting = Vec::new();
        for key in self.holders.keys() {
            if let Some(waiters) = self.holders.update(key, ChunkHolder::take_all_waiters) {
                waiting.extend(waiters.into_iter().map(|(_, waiter)| waiter));
            }
        }
        for waiter in waiting {
            waiter.completer.complete(Err(ChunkError::ShuttingDown));
        }
        flushed
    }

    /// Returns true once [`ChunkHolderManager::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live holders.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    /// Last completed stage of `pos`.
    #[must_use]
    pub fn status(&self, pos: ChunkPos) -> Option<ChunkStatus> {
        self.holders.with(pos.as_i64(), |holder| holder.current).flatten()
    }

    /// Stage `pos` is being driven towards.
    #[must_use]
    pub fn target(&self, pos: ChunkPos) -> Option<ChunkStatus> {
        self.holders.with(pos.as_i64(), |holder| holder.target).flatten()
    }

    /// Returns true if `pos` waits in the unload queue.
    #[must_use]
    pub fn is_queued_for_unload(&self, pos: ChunkPos) -> bool {
        self.unload_queue.contains(pos)
    }

    /// Number of chunks waiting in the unload queue.
    #[must_use]
    pub fn unload_queue_len(&self) -> usize {
        self.unload_queue.len()
    }

    /// Dumps holders, tickets and the unload queue as JSON.
    #[must_use]
    pub fn debug_json(&self) -> serde_json::Value {
        let mut holders = Vec::new();
        self.holders.for_each(|_, holder| holders.push(holder.to_json()));
        serde_json::json!({
            "tick": self.current_tick(),
            "pending": self.pending.lock().len(),
            "queued_tasks": self.scheduler.queued_tasks(),
            "holders": holders,
            "tickets": self.tickets.debug_json(),
            "unload_queue": self.unload_queue.debug_json(),
        })
    }

    #[cfg(test)]
    fn generation_of(&self, pos: ChunkPos) -> Option<u64> {
        self.holders.with(pos.as_i64(), |holder| holder.generation)
    }
}

impl Drop for ChunkHolderManager {
    fn drop(&mut self) {
        if !self.is_closed()
            && let Err(err) = self.close(false)
        {
            log::error!("Failed to close chunk system: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

    use super::*;
    use crate::chunk::flat_chunk_generator::FlatChunkGenerator;
    use crate::chunk_saver::{ram_only::RamOnlyStorage, storage::BlobStorage};

    /// Holds every read until the test releases it.
    struct GatedReads {
        started: Sender<ChunkPos>,
        gate: Receiver<()>,
        reads: AtomicUsize,
    }

    impl BlobStorage for GatedReads {
        fn read_blob(&self, pos: ChunkPos) -> io::Result<Option<Vec<u8>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(pos);
            self.gate.recv().map_err(io::Error::other)?;
            Ok(None)
        }

        fn write_blob(&self, _pos: ChunkPos, _blob: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    fn manager(config: ChunkSystemConfig) -> ChunkHolderManager {
        ChunkHolderManager::new(
            config,
            ChunkStorage::RamOnly(RamOnlyStorage::new()),
            ChunkGeneratorType::Flat(FlatChunkGenerator::new(1, 2, 3, 4)),
        )
        .expect("valid config")
    }

    fn small_config() -> ChunkSystemConfig {
        ChunkSystemConfig {
            worker_threads: 2,
            io_threads: 1,
            ..ChunkSystemConfig::default()
        }
    }

    #[test]
    fn test_removed_ticket_queues_unload() {
        let chunks = manager(ChunkSystemConfig {
            max_stage_tasks_per_tick: 1,
            unload_min_batch: 0,
            unload_fraction: 0.0,
            ..small_config()
        });
        let origin = ChunkPos::new(0, 0);
        let edge = ChunkPos::new(2, 0);
        chunks
            .tickets()
            .add_ticket(TicketType::FORCED, origin, 0, 0)
            .expect("valid ticket");
        chunks.tick();
        assert_eq!(chunks.tickets().ticket_level(edge), 2);
        assert_eq!(chunks.target(edge), Some(ChunkStatus::Full));

        chunks
            .tickets()
            .remove_ticket(TicketType::FORCED, origin, 0, 0)
            .expect("ticket exists");
        chunks.tick();
        assert_eq!(chunks.tickets().ticket_level(edge), ChunkLevel::MAX_LEVEL);
        assert_eq!(chunks.target(edge), None);
        assert!(chunks.is_queued_for_unload(edge));
        chunks.close(false).expect("close");
    }

    #[test]
    fn test_stale_results_are_discarded() {
        let chunks = manager(small_config());
        let pos = ChunkPos::new(5, 5);
        let future = chunks.get_or_load_chunk(pos, ChunkStatus::Empty);
        let generation = chunks.generation_of(pos).expect("holder created");

        // Neither an older holder's result nor one nobody asked for may land.
        for wrong in [generation + 1000, generation] {
            chunks.scheduler.inject_result(TaskResult::Generated {
                pos,
                generation: wrong,
                stage: ChunkStatus::Empty,
                result: Ok(ChunkArtifact::new(pos, ChunkStatus::Empty, vec![0xAB])),
            });
        }
        chunks.process_task_results();
        assert_eq!(chunks.status(pos), None);
        assert!(!future.is_done());

        let artifact = chunks
            .block_on(&future)
            .expect("not cancelled")
            .expect("generated");
        assert_eq!(artifact.status, ChunkStatus::Empty);
        assert!(artifact.data.is_empty());
        chunks.close(false).expect("close");
    }

    #[test]
    fn test_request_resolves_and_releases_ticket() {
        let chunks = manager(small_config());
        let pos = ChunkPos::new(-3, 7);
        let future = chunks.get_or_load_chunk(pos, ChunkStatus::Noise);
        let again = chunks.get_or_load_chunk(pos, ChunkStatus::Noise);
        let artifact = chunks
            .block_on(&future)
            .expect("not cancelled")
            .expect("generated");
        assert_eq!(artifact.status, ChunkStatus::Noise);
        let shared = again.wait().expect("not cancelled").expect("generated");
        assert!(Arc::ptr_eq(&artifact, &shared));
        assert!(chunks.tickets().tickets_at(pos).is_empty());

        let ready = chunks.get_or_load_chunk(pos, ChunkStatus::Biomes);
        assert!(ready.is_done());
        chunks.close(false).expect("close");
    }

    #[test]
    fn test_closed_rejects_requests() {
        let chunks = manager(small_config());
        chunks.close(true).expect("close");
        let future = chunks.get_or_load_chunk(ChunkPos::new(0, 0), ChunkStatus::Full);
        assert!(matches!(
            future.peek(),
            Some(Ok(Err(ChunkError::ShuttingDown)))
        ));
    }

    #[test]
    fn test_debug_json_lists_holders() {
        let chunks = manager(small_config());
        let _future = chunks.get_or_load_chunk(ChunkPos::new(1, 1), ChunkStatus::Empty);
        let json = chunks.debug_json();
        assert_eq!(json["holders"].as_array().map(Vec::len), Some(1));
        assert_eq!(json["holders"][0]["waiters"][0], "empty");
        chunks.close(false).expect("close");
    }

    #[test]
    fn test_queued_load_can_be_raised_and_cancelled() {
        let (started_tx, started) = unbounded();
        let (release, gate) = bounded(0);
        let storage = Arc::new(GatedReads {
            started: started_tx,
            gate,
            reads: AtomicUsize::new(0),
        });
        let chunks = ChunkHolderManager::new(
            ChunkSystemConfig {
                io_threads: 1,
                ..small_config()
            },
            ChunkStorage::Custom(storage.clone()),
            ChunkGeneratorType::Flat(FlatChunkGenerator::new(1, 2, 3, 4)),
        )
        .expect("valid config");
        let first = ChunkPos::new(0, 0);
        let second = ChunkPos::new(100, 100);

        let _first = chunks.get_or_load_chunk(first, ChunkStatus::Empty);
        chunks.tick();
        assert_eq!(started.recv().expect("read started"), first);

        // The only I/O thread is busy, so this load stays queued.
        let waiting = chunks.get_or_load_chunk(second, ChunkStatus::Empty);
        chunks.tick();
        assert!(chunks.raise_priority(second, Priority::Blocking));
        let handle = chunks
            .holders
            .with(second.as_i64(), |holder| {
                holder.in_flight.as_ref().and_then(|task| task.handle.clone())
            })
            .flatten()
            .expect("load in flight");
        assert!(handle.cancel());

        release.send(()).expect("first read waiting");
        let result = chunks.block_on(&waiting).expect("not cancelled");
        assert!(matches!(result, Err(ChunkError::Cancelled { .. })), "{result:?}");
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);
        chunks.close(false).expect("close");
    }

    #[test]
    fn test_unload_of_reused_chunk_is_delayed() {
        let chunks = manager(ChunkSystemConfig {
            unload_min_batch: 0,
            unload_fraction: 0.0,
            ..small_config()
        });
        let pos = ChunkPos::new(4, 4);
        chunks
            .tickets()
            .add_ticket(TicketType::FORCED, pos, 44, 0)
            .expect("valid ticket");
        chunks.tick();
        chunks
            .tickets()
            .remove_ticket(TicketType::FORCED, pos, 44, 0)
            .expect("ticket exists");
        for _ in 0..10_000 {
            if chunks.is_queued_for_unload(pos) {
                break;
            }
            chunks.tick();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(chunks.is_queued_for_unload(pos));

        // A request arrives between queueing and unloading.
        let future = chunks.get_or_load_chunk(pos, ChunkStatus::Empty);
        chunks.unload_queue.remove_chunk(pos);
        assert!(!chunks.unload(pos));
        assert_eq!(chunks.holder_count(), 1);
        assert!(chunks.tickets().has_ticket_type(pos, TicketType::UNLOAD_COOLDOWN));

        chunks
            .block_on(&future)
            .expect("not cancelled")
            .expect("generated");
        chunks.tick();
        chunks.tick();
        assert_eq!(chunks.target(pos), None);
        assert!(!chunks.is_queued_for_unload(pos));

        for _ in 0..TicketType::UNLOAD_COOLDOWN.timeout {
            chunks.tick();
        }
        assert!(!chunks.tickets().has_ticket_type(pos, TicketType::UNLOAD_COOLDOWN));
        assert!(chunks.is_queued_for_unload(pos));
        chunks.close(false).expect("close");
    }
}
