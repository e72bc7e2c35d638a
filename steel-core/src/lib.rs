//! # Steel Core
//!
//! The chunk system: tickets and level propagation, chunk holders and their
//! generation pipeline, region-batched I/O and the unload queue.
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    missing_docs,
    clippy::unwrap_used
)]
#![allow(
    clippy::single_call_fn,
    clippy::multiple_inherent_impl,
    clippy::missing_errors_doc,
    clippy::struct_excessive_bools,
    clippy::needless_pass_by_value,
    clippy::cargo_common_metadata,
    clippy::module_name_repetitions
)]

use std::{io, sync::Arc};

use steel_utils::{
    ChunkPos,
    concurrent::{Cancelled, Completion, Priority},
};

/// Tickets, levels, holders and generation.
pub mod chunk;
/// Storage backends and region I/O.
pub mod chunk_saver;
/// Chunk system configuration.
pub mod config;
/// Error types.
pub mod error;
/// Unload queue.
pub mod queue;

use crate::{
    chunk::{
        chunk_generator::ChunkGeneratorType,
        chunk_holder::ChunkFuture,
        chunk_holder_manager::{ChunkHolderManager, ChunkListener},
        chunk_status::ChunkStatus,
        ticket::{Ticket, TicketType},
    },
    chunk_saver::storage::ChunkStorage,
    config::ChunkSystemConfig,
    error::TicketError,
};

/// Entry point of the chunk system.
///
/// Construct one per world and tick it from the owning thread.
pub struct ChunkSystem {
    manager: ChunkHolderManager,
}

impl ChunkSystem {
    /// Starts a chunk system over `storage`, generating with `generator`.
    pub fn new(
        config: ChunkSystemConfig,
        storage: ChunkStorage,
        generator: ChunkGeneratorType,
    ) -> io::Result<Self> {
        Ok(Self {
            manager: ChunkHolderManager::new(config, storage, generator)?,
        })
    }

    /// The holder manager behind this system.
    #[must_use]
    pub fn manager(&self) -> &ChunkHolderManager {
        &self.manager
    }

    /// Adds a ticket; it takes effect on the next tick.
    pub fn add_ticket(
        &self,
        ticket_type: TicketType,
        pos: ChunkPos,
        level: u8,
        id: u64,
    ) -> Result<(), TicketError> {
        self.manager.tickets().add_ticket(ticket_type, pos, level, id)
    }

    /// Removes one instance of a ticket.
    pub fn remove_ticket(
        &self,
        ticket_type: TicketType,
        pos: ChunkPos,
        level: u8,
        id: u64,
    ) -> Result<(), TicketError> {
        self.manager
            .tickets()
            .remove_ticket(ticket_type, pos, level, id)
    }

    /// Swaps one ticket for another at `pos`.
    pub fn add_and_remove_tickets(
        &self,
        pos: ChunkPos,
        add: Ticket,
        remove: Ticket,
    ) -> Result<(), TicketError> {
        self.manager.tickets().add_and_remove_tickets(pos, add, remove)
    }

    /// Removes every ticket of this type, level and id.
    pub fn remove_all_tickets_for(&self, ticket_type: TicketType, level: u8, id: u64) -> usize {
        self.manager
            .tickets()
            .remove_all_tickets_for(ticket_type, level, id)
    }

    /// Propagated ticket level of `pos`.
    #[must_use]
    pub fn ticket_level(&self, pos: ChunkPos) -> u8 {
        self.manager.tickets().ticket_level(pos)
    }

    /// Requests `pos` at `stage` or beyond. Safe from any thread.
    pub fn get_or_load_chunk(&self, pos: ChunkPos, stage: ChunkStatus) -> ChunkFuture {
        self.manager.get_or_load_chunk(pos, stage)
    }

    /// Raises the priority of the work running for `pos`.
    pub fn raise_priority(&self, pos: ChunkPos, priority: Priority) -> bool {
        self.manager.raise_priority(pos, priority)
    }

    /// Registers a listener for level, stage and unload events.
    pub fn add_listener(&self, listener: Arc<dyn ChunkListener>) {
        self.manager.add_listener(listener);
    }

    /// Runs one tick.
    pub fn tick(&self) {
        self.manager.tick();
    }

    /// Waits for `completion` while keeping chunk work moving.
    pub fn block_on<T: Clone>(&self, completion: &Completion<T>) -> Result<T, Cancelled> {
        self.manager.block_on(completion)
    }

    /// Writes every unsaved chunk.
    pub fn save_all(&self, flush: bool) -> io::Result<()> {
        self.manager.save_all(flush)
    }

    /// Shuts the system down.
    pub fn close(&self, save: bool) -> io::Result<()> {
        self.manager.close(save)
    }

    /// Last completed stage of `pos`.
    #[must_use]
    pub fn status(&self, pos: ChunkPos) -> Option<ChunkStatus> {
        self.manager.status(pos)
    }

    /// Number of live chunk holders.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.manager.holder_count()
    }

    /// Dumps the whole system state as JSON.
    #[must_use]
    pub fn debug_json(&self) -> serde_json::Value {
        self.manager.debug_json()
    }
}
