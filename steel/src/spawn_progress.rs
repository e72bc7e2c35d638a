//! Spawn chunk generation.
//!
//! During server startup, generates chunks around the spawn position until
//! the whole spawn square is Full, logging progress while it waits.

use std::time::{Duration, Instant};

use steel_core::{
    ChunkSystem,
    chunk::{chunk_level::ChunkLevel, chunk_status::ChunkStatus, ticket::TicketType},
};
use steel_utils::ChunkPos;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Ticket id of the spawn ticket.
const SPAWN_TICKET_ID: u64 = 0;
/// Ticks between two progress log lines.
const PROGRESS_INTERVAL: u64 = 20;

/// Outcome of preparing the spawn area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Every spawn chunk reached Full.
    Ready,
    /// Shutdown was requested first.
    Cancelled,
}

/// Number of chunks in a spawn square of `radius`.
#[must_use]
pub fn spawn_chunk_count(radius: u8) -> usize {
    let side = usize::from(radius) * 2 + 1;
    side * side
}

/// Places the spawn ticket at `center` and ticks until every chunk within
/// `radius` is Full.
///
/// The ticket stays in place afterwards so the spawn area remains loaded.
pub async fn generate_spawn_chunks(
    chunks: &ChunkSystem,
    center: ChunkPos,
    radius: u8,
    tick_interval: Duration,
    cancel_token: &CancellationToken,
) -> anyhow::Result<SpawnOutcome> {
    let total = spawn_chunk_count(radius);
    log::info!(
        "Preparing spawn area: {total} chunks around chunk ({}, {})",
        center.x,
        center.z,
    );

    // Distance `radius` lands exactly on the Full level.
    let ticket_level = ChunkLevel::FULL_STATUS_LEVEL.saturating_sub(radius);
    chunks.add_ticket(TicketType::START, center, ticket_level, SPAWN_TICKET_ID)?;

    let start = Instant::now();
    let mut tick_count: u64 = 0;
    loop {
        chunks.tick();
        tick_count += 1;

        let completed = center
            .square(i32::from(radius))
            .filter(|&pos| chunks.status(pos) == Some(ChunkStatus::Full))
            .count();
        if completed == total {
            break;
        }
        if tick_count % PROGRESS_INTERVAL == 0 {
            log::info!(
                "Preparing spawn area: {}% ({completed}/{total})",
                completed * 100 / total
            );
        }

        tokio::select! {
            () = cancel_token.cancelled() => {
                log::warn!("Spawn preparation interrupted after {tick_count} ticks");
                return Ok(SpawnOutcome::Cancelled);
            }
            () = sleep(tick_interval) => {}
        }
    }

    log::info!(
        "Spawn area ready in {:.2}s ({tick_count} ticks)",
        start.elapsed().as_secs_f64()
    );
    Ok(SpawnOutcome::Ready)
}

#[cfg(test)]
mod tests {
    use steel_core::{
        chunk::{chunk_generator::ChunkGeneratorType, flat_chunk_generator::FlatChunkGenerator},
        chunk_saver::{ram_only::RamOnlyStorage, storage::ChunkStorage},
        config::ChunkSystemConfig,
    };

    use super::*;

    #[test]
    fn test_spawn_chunk_count() {
        assert_eq!(spawn_chunk_count(0), 1);
        assert_eq!(spawn_chunk_count(3), 49);
    }

    #[tokio::test]
    async fn test_spawn_area_reaches_full() {
        let chunks = ChunkSystem::new(
            ChunkSystemConfig {
                worker_threads: 2,
                io_threads: 1,
                ..ChunkSystemConfig::default()
            },
            ChunkStorage::RamOnly(RamOnlyStorage::new()),
            ChunkGeneratorType::Flat(FlatChunkGenerator::new(1, 2, 3, 4)),
        )
        .expect("valid config");
        let center = ChunkPos::new(4, -2);

        let outcome = generate_spawn_chunks(
            &chunks,
            center,
            1,
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await
        .expect("spawn ticket is valid");

        assert_eq!(outcome, SpawnOutcome::Ready);
        assert_eq!(chunks.ticket_level(center), ChunkLevel::FULL_STATUS_LEVEL - 1);
        assert_eq!(chunks.status(ChunkPos::new(5, -1)), Some(ChunkStatus::Full));
        chunks.close(false).expect("close");
    }

    #[tokio::test]
    async fn test_cancelled_spawn_returns_early() {
        let chunks = ChunkSystem::new(
            ChunkSystemConfig {
                worker_threads: 1,
                io_threads: 1,
                ..ChunkSystemConfig::default()
            },
            ChunkStorage::RamOnly(RamOnlyStorage::new()),
            ChunkGeneratorType::Flat(FlatChunkGenerator::new(1, 2, 3, 4)),
        )
        .expect("valid config");
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let outcome = generate_spawn_chunks(
            &chunks,
            ChunkPos::new(0, 0),
            8,
            Duration::from_secs(1),
            &cancel_token,
        )
        .await
        .expect("spawn ticket is valid");
        assert_eq!(outcome, SpawnOutcome::Cancelled);
        chunks.close(false).expect("close");
    }
}
