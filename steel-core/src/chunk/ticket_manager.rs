//! Ticket storage and batched level updates.
//!
//! Tickets may be added and removed from any thread. Changes only mark the
//! coordinate dirty; levels are recomputed in one batch by
//! [`TicketManager::run_pending_updates`], normally once per tick.

use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashSet;
use steel_utils::{ChunkPos, concurrent::ShardedLongMap, locks::SyncMutex};

use crate::{
    chunk::{
        chunk_level::ChunkLevel,
        level_propagator::{LevelChange, LevelPropagator},
        ticket::{ChunkTickets, Ticket, TicketType},
    },
    error::TicketError,
};

/// Highest level a ticket may be added at.
pub const MAX_TICKET_LEVEL: u8 = ChunkLevel::MAX_LEVEL;

/// Owns every ticket and the level propagator.
pub struct TicketManager {
    tickets: ShardedLongMap<ChunkTickets>,
    dirty: SyncMutex<FxHashSet<i64>>,
    timed: SyncMutex<FxHashSet<i64>>,
    propagator: SyncMutex<LevelPropagator>,
    current_tick: AtomicU64,
}

impl TicketManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(step_cost: u8, region_shift: u32, stripes: usize) -> Self {
        Self {
            tickets: ShardedLongMap::with_shift(region_shift, stripes),
            dirty: SyncMutex::new(FxHashSet::default()),
            timed: SyncMutex::new(FxHashSet::default()),
            propagator: SyncMutex::new(LevelPropagator::new(step_cost, MAX_TICKET_LEVEL)),
            current_tick: AtomicU64::new(0),
        }
    }

    fn mark_dirty(&self, key: i64) {
        self.dirty.lock().insert(key);
    }

    fn check_level(level: u8) -> Result<(), TicketError> {
        if level > MAX_TICKET_LEVEL {
            return Err(TicketError::InvalidLevel {
                level,
                max: MAX_TICKET_LEVEL,
            });
        }
        Ok(())
    }

    /// Adds a ticket. The same ticket may be added several times.
    pub fn add_ticket(
        &self,
        ticket_type: TicketType,
        pos: ChunkPos,
        level: u8,
        id: u64,
    ) -> Result<(), TicketError> {
        Self::check_level(level)?;
        let ticket = Ticket::new(ticket_type, level, id);
        let key = pos.as_i64();
        let tick = self.current_tick.load(Ordering::Acquire);
        let changed = self.tickets.get_or_insert_with(key, ChunkTickets::default, |tickets| {
            let before = tickets.min_level();
            tickets.add(ticket, tick);
            if ticket_type.expires() {
                self.timed.lock().insert(key);
            }
            tickets.min_level() != before
        });
        if changed {
            self.mark_dirty(key);
        }
        Ok(())
    }

    /// Removes one instance of a ticket.
    ///
    /// A missing ticket is reported as [`TicketError::NotFound`] and logged.
    pub fn remove_ticket(
        &self,
        ticket_type: TicketType,
        pos: ChunkPos,
        level: u8,
        id: u64,
    ) -> Result<(), TicketError> {
        Self::check_level(level)?;
        let ticket = Ticket::new(ticket_type, level, id);
        let key = pos.as_i64();
        let removed = self.tickets.compute(key, |slot| {
            let tickets = slot.as_mut()?;
            let before = tickets.min_level();
            if !tickets.remove(&ticket) {
                return None;
            }
            let changed = tickets.min_level() != before;
            if tickets.is_empty() {
                *slot = None;
            }
            Some(changed)
        });
        match removed {
            Some(changed) => {
                if changed {
                    self.mark_dirty(key);
                }
                Ok(())
            }
            None => {
                let err = TicketError::NotFound {
                    pos,
                    ticket_type: ticket_type.name,
                    level,
                    id,
                };
                log::error!("Failed to remove ticket: {err}");
                Err(err)
            }
        }
    }

    /// Adds `add` and removes `remove` at `pos` as one step.
    ///
    /// The add always happens; the result reports the removal.
    pub fn add_and_remove_tickets(
        &self,
        pos: ChunkPos,
        add: Ticket,
        remove: Ticket,
    ) -> Result<(), TicketError> {
        Self::check_level(add.level)?;
        Self::check_level(remove.level)?;
        let key = pos.as_i64();
        let tick = self.current_tick.load(Ordering::Acquire);
        let (changed, removed) = self.tickets.compute(key, |slot| {
            let tickets = slot.get_or_insert_with(ChunkTickets::default);
            let before = tickets.min_level();
            tickets.add(add, tick);
            if add.ticket_type.expires() {
                self.timed.lock().insert(key);
            }
            let removed = tickets.remove(&remove);
            (tickets.min_level() != before, removed)
        });
        if changed {
            self.mark_dirty(key);
        }
        if removed {
            Ok(())
        } else {
            let err = TicketError::NotFound {
                pos,
                ticket_type: remove.ticket_type.name,
                level: remove.level,
                id: remove.id,
            };
            log::error!("Failed to remove ticket: {err}");
            Err(err)
        }
    }

    /// Removes every ticket of this type, level and id, wherever it is held.
    ///
    /// Returns the number of tickets removed.
    pub fn remove_all_tickets_for(&self, ticket_type: TicketType, level: u8, id: u64) -> usize {
        if level > MAX_TICKET_LEVEL {
            return 0;
        }
        let pattern = Ticket::new(ticket_type, level, id);
        let mut removed_total = 0;
        for key in self.tickets.keys() {
            let result = self.tickets.compute(key, |slot| {
                let tickets = slot.as_mut()?;
                let before = tickets.min_level();
                let removed = tickets.remove_all(&pattern);
                let changed = tickets.min_level() != before;
                if tickets.is_empty() {
                    *slot = None;
                }
                Some((removed, changed))
            });
            if let Some((removed, changed)) = result {
                removed_total += removed;
                if changed {
                    self.mark_dirty(key);
                }
            }
        }
        removed_total
    }

    /// Advances the ticket clock and drops expired tickets.
    ///
    /// Returns the coordinates that lost a ticket.
    pub fn tick(&self, current_tick: u64) -> Vec<ChunkPos> {
        self.current_tick.store(current_tick, Ordering::Release);
        let timed: Vec<i64> = self.timed.lock().iter().copied().collect();
        let mut expired_at = Vec::new();
        for key in timed {
            // The timed set is updated under the stripe lock, like every add.
            let (expired, changed) = self.tickets.compute(key, |slot| {
                let Some(tickets) = slot.as_mut() else {
                    self.timed.lock().remove(&key);
                    return (0, false);
                };
                let before = tickets.min_level();
                let expired = tickets.expire(current_tick);
                let changed = expired > 0 && tickets.min_level() != before;
                if !tickets.has_timed() {
                    self.timed.lock().remove(&key);
                }
                if tickets.is_empty() {
                    *slot = None;
                }
                (expired, changed)
            });
            if changed {
                self.mark_dirty(key);
            }
            if expired > 0 {
                expired_at.push(ChunkPos::from_i64(key));
            }
        }
        expired_at
    }

    /// The tick last passed to [`TicketManager::tick`].
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    /// Returns true if ticket changes are waiting to be propagated.
    #[must_use]
    pub fn has_pending_updates(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Recomputes levels for every coordinate touched since the last call.
    pub fn run_pending_updates(&self) -> Vec<LevelChange> {
        let dirty = std::mem::take(&mut *self.dirty.lock());
        if dirty.is_empty() {
            return Vec::new();
        }
        let _span = tracing::debug_span!("ticket_updates", sources = dirty.len()).entered();

        let mut propagator = self.propagator.lock();
        for key in dirty {
            let level = self
                .tickets
                .with(key, ChunkTickets::min_level)
                .flatten()
                .unwrap_or(MAX_TICKET_LEVEL);
            propagator.set_source(ChunkPos::from_i64(key), level);
        }
        let changes = propagator.propagate_updates();
        log::trace!("Ticket update changed {} levels", changes.len());
        changes
    }

    /// Propagated level at `pos` as of the last batch.
    #[must_use]
    pub fn ticket_level(&self, pos: ChunkPos) -> u8 {
        self.propagator.lock().level(pos)
    }

    /// Tickets currently held at `pos`.
    #[must_use]
    pub fn tickets_at(&self, pos: ChunkPos) -> Vec<Ticket> {
        self.tickets
            .with(pos.as_i64(), |tickets| tickets.tickets().collect())
            .unwrap_or_default()
    }

    /// Returns true if `pos` holds a ticket of `ticket_type`.
    #[must_use]
    pub fn has_ticket_type(&self, pos: ChunkPos, ticket_type: TicketType) -> bool {
        self.tickets
            .with(pos.as_i64(), |tickets| {
                tickets.tickets().any(|ticket| ticket.ticket_type == ticket_type)
            })
            .unwrap_or(false)
    }

    /// Number of coordinates holding at least one ticket.
    #[must_use]
    pub fn ticketed_chunks(&self) -> usize {
        self.tickets.len()
    }

    /// Dumps every ticket as JSON.
    #[must_use]
    pub fn debug_json(&self) -> serde_json::Value {
        let mut chunks = Vec::new();
        self.tickets.for_each(|key, tickets| {
            chunks.push(tickets.to_json(ChunkPos::from_i64(key)));
        });
        serde_json::json!({
            "current_tick": self.current_tick(),
            "chunks": chunks,
        })
    }
}
