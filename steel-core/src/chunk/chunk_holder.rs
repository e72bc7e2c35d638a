//! Per-coordinate chunk state.

use std::{collections::BTreeMap, sync::Arc};

use steel_utils::{
    ChunkPos,
    concurrent::{Completer, Completion},
};

use crate::{
    chunk::{
        chunk_artifact::ChunkArtifact, chunk_level::ChunkLevel, chunk_status::ChunkStatus,
        chunk_task_scheduler::ChunkTaskHandle,
    },
    error::ChunkError,
};

/// Outcome of a chunk request.
pub type ChunkResult = Result<Arc<ChunkArtifact>, ChunkError>;
/// Shared future of a chunk request.
pub type ChunkFuture = Completion<ChunkResult>;

/// The single task a holder may have running.
pub(crate) struct InFlight {
    /// Stage being generated, `None` while loading from storage.
    pub stage: Option<ChunkStatus>,
    /// Handle of the load or generation, once it was scheduled.
    pub handle: Option<ChunkTaskHandle>,
}

/// Callers waiting for a holder to reach a stage.
pub(crate) struct Waiter {
    pub completer: Completer<ChunkResult>,
    pub completion: ChunkFuture,
}

/// State of one coordinate.
///
/// Lives in the holder map; stage fields are only changed by the tick thread.
pub(crate) struct ChunkHolder {
    pub pos: ChunkPos,
    /// Unique per holder instance; results of older instances are ignored.
    pub generation: u64,
    pub ticket_level: u8,
    pub target: Option<ChunkStatus>,
    pub current: Option<ChunkStatus>,
    pub artifact: Option<Arc<ChunkArtifact>>,
    pub in_flight: Option<InFlight>,
    pub waiters: BTreeMap<ChunkStatus, Waiter>,
    /// Stage whose generation failed; cleared by the next request for this
    /// chunk or a neighbour.
    pub failed: Option<ChunkStatus>,
    pub load_attempted: bool,
    pub unsaved: bool,
    pub last_save_tick: u64,
    pub autosave_at: Option<u64>,
    pub in_unload_queue: bool,
    /// Dependency tickets this holder placed on neighbours, with their level.
    pub dependency_tickets: Vec<(ChunkPos, u8)>,
}

impl ChunkHolder {
    pub fn new(pos: ChunkPos, generation: u64, ticket_level: u8) -> Self {
        Self {
            pos,
            generation,
            ticket_level,
            target: ChunkLevel::generation_status(ticket_level),
            current: None,
            artifact: None,
            in_flight: None,
            waiters: BTreeMap::new(),
            failed: None,
            load_attempted: false,
            unsaved: false,
            last_save_tick: 0,
            autosave_at: None,
            in_unload_queue: false,
            dependency_tickets: Vec::new(),
        }
    }

    /// Idle, unwanted and nobody waiting on it.
    pub fn is_safe_to_unload(&self) -> bool {
        self.target.is_none() && self.in_flight.is_none() && self.waiters.is_empty()
    }

    /// Returns true if the holder has reached `status`.
    pub fn has_reached(&self, status: ChunkStatus) -> bool {
        self.current.is_some_and(|current| current >= status)
    }

    /// Removes and returns every waiter satisfied by `status`.
    pub fn take_waiters_up_to(&mut self, status: ChunkStatus) -> Vec<(ChunkStatus, Waiter)> {
        let rest = match status.next() {
            Some(next) => self.waiters.split_off(&next),
            None => BTreeMap::new(),
        };
        std::mem::replace(&mut self.waiters, rest).into_iter().collect()
    }

    /// Removes and returns every waiter.
    pub fn take_all_waiters(&mut self) -> Vec<(ChunkStatus, Waiter)> {
        std::mem::take(&mut self.waiters).into_iter().collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "chunkX": self.pos.x,
            "chunkZ": self.pos.z,
            "generation": self.generation,
            "level": self.ticket_level,
            "target": self.target.map(ChunkStatus::name),
            "current": self.current.map(ChunkStatus::name),
            "in_flight": self.in_flight.as_ref().map(|task| task.stage.map_or("load", ChunkStatus::name)),
            "waiters": self.waiters.keys().map(|status| status.name()).collect::<Vec<_>>(),
            "failed": self.failed.map(ChunkStatus::name),
            "unsaved": self.unsaved,
            "dependency_tickets": self.dependency_tickets.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use steel_utils::concurrent::completion;

    use super::*;

    fn waiter() -> Waiter {
        let (completer, completion) = completion();
        Waiter {
            completer,
            completion,
        }
    }

    #[test]
    fn test_take_waiters_up_to() {
        let mut holder = ChunkHolder::new(ChunkPos::new(0, 0), 1, 33);
        for status in [ChunkStatus::Empty, ChunkStatus::Noise, ChunkStatus::Full] {
            holder.waiters.insert(status, waiter());
        }
        let taken: Vec<_> = holder
            .take_waiters_up_to(ChunkStatus::Noise)
            .into_iter()
            .map(|(status, _)| status)
            .collect();
        assert_eq!(taken, vec![ChunkStatus::Empty, ChunkStatus::Noise]);
        assert_eq!(holder.waiters.len(), 1);
        assert_eq!(holder.take_waiters_up_to(ChunkStatus::Full).len(), 1);
    }

    #[test]
    fn test_safe_to_unload() {
        let mut holder = ChunkHolder::new(ChunkPos::new(0, 0), 1, ChunkLevel::MAX_LEVEL);
        assert!(holder.target.is_none());
        assert!(holder.is_safe_to_unload());
        holder.waiters.insert(ChunkStatus::Full, waiter());
        assert!(!holder.is_safe_to_unload());
    }
}
