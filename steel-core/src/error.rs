//! Error types of the chunk system.

use std::{io, sync::Arc};

use steel_utils::{ChunkPos, concurrent::TaskError};
use thiserror::Error;

use crate::chunk::chunk_status::ChunkStatus;

/// Errors returned by ticket operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    /// The requested level is above the maximum ticket level.
    #[error("ticket level {level} exceeds the maximum of {max}")]
    InvalidLevel {
        /// Requested level.
        level: u8,
        /// Highest accepted level.
        max: u8,
    },
    /// No matching ticket exists at the coordinate.
    #[error("no '{ticket_type}' ticket at level {level} with id {id} exists at {pos}")]
    NotFound {
        /// Coordinate the ticket was expected at.
        pos: ChunkPos,
        /// Name of the ticket type.
        ticket_type: &'static str,
        /// Ticket level.
        level: u8,
        /// Ticket identifier.
        id: u64,
    },
}

/// Failure of a chunk request.
///
/// Cloneable so one failure can be handed to every waiter of a chunk.
#[derive(Debug, Clone, Error)]
pub enum ChunkError {
    /// Reading or writing the chunk's blob failed.
    #[error("i/o failure for chunk {pos}: {source}")]
    Io {
        /// Affected chunk.
        pos: ChunkPos,
        /// Underlying error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The generator returned an error.
    #[error("generating {stage:?} for chunk {pos} failed: {error:#}")]
    Generation {
        /// Affected chunk.
        pos: ChunkPos,
        /// Stage that was being generated.
        stage: ChunkStatus,
        /// Generator error.
        error: Arc<anyhow::Error>,
    },
    /// A neighbour the stage reads failed before reaching the stage it needs.
    #[error("cannot generate {stage:?} for chunk {pos}, neighbour {neighbour} failed")]
    NeighbourFailed {
        /// Affected chunk.
        pos: ChunkPos,
        /// Stage that could not run.
        stage: ChunkStatus,
        /// The failed neighbour.
        neighbour: ChunkPos,
    },
    /// A stored blob could not be decoded.
    #[error("stored data for chunk {pos} is corrupt: {reason}")]
    Corrupt {
        /// Affected chunk.
        pos: ChunkPos,
        /// What was wrong with it.
        reason: String,
    },
    /// The task computing the chunk panicked or was cancelled.
    #[error("task for chunk {pos} failed: {source}")]
    Task {
        /// Affected chunk.
        pos: ChunkPos,
        /// Executor error.
        #[source]
        source: TaskError,
    },
    /// The request was dropped before it completed.
    #[error("request for chunk {pos} was dropped")]
    Cancelled {
        /// Affected chunk.
        pos: ChunkPos,
    },
    /// The chunk system is closing.
    #[error("the chunk system is shutting down")]
    ShuttingDown,
}
