//! # Steel
//!
//! The server around the chunk system: configuration, startup and the tick loop.
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
    clippy::shadow_unrelated,
    clippy::missing_errors_doc,
    clippy::struct_excessive_bools,
    clippy::needless_pass_by_value,
    clippy::cargo_common_metadata
)]

use std::{fs, path::Path, sync::Arc, time::Duration};

use steel_core::{
    ChunkSystem,
    chunk::{chunk_generator::ChunkGeneratorType, flat_chunk_generator::FlatChunkGenerator},
    chunk_saver::{
        ram_only::RamOnlyStorage, region_storage::RegionFileStorage, storage::ChunkStorage,
    },
};
use steel_utils::ChunkPos;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SteelConfig,
    spawn_progress::{SpawnOutcome, generate_spawn_chunks},
};

/// Server configuration.
pub mod config;
/// Spawn area preparation.
pub mod spawn_progress;

/// Chunk the spawn area is centred on.
pub const SPAWN_CHUNK: ChunkPos = ChunkPos::new(0, 0);

/// The main server struct.
pub struct SteelServer {
    /// The cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// The chunk system of the world.
    pub chunks: Arc<ChunkSystem>,
    /// The loaded configuration.
    pub config: SteelConfig,
}

impl SteelServer {
    /// Opens the world storage and starts the chunk system.
    pub fn new(config: SteelConfig) -> anyhow::Result<Self> {
        log::info!("Starting Steel Server");
        let storage = if config.ram_only {
            log::warn!("Running with ram_only, chunks will not be saved");
            ChunkStorage::RamOnly(RamOnlyStorage::new())
        } else {
            let root = Path::new(&config.world_dir).join("region");
            ChunkStorage::Disk(RegionFileStorage::open(
                root,
                config.chunk_system.region_shift,
                config.chunk_system.compression_level,
            )?)
        };
        let generator = ChunkGeneratorType::Flat(FlatChunkGenerator::new(1, 2, 3, 4));
        let chunks = ChunkSystem::new(config.chunk_system.clone(), storage, generator)?;

        Ok(Self {
            cancel_token: CancellationToken::new(),
            chunks: Arc::new(chunks),
            config,
        })
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.tick_millis)
    }

    /// Generates the spawn area, then ticks the chunk system until stopped.
    pub async fn start(&self) -> anyhow::Result<JoinHandle<()>> {
        let outcome = generate_spawn_chunks(
            &self.chunks,
            SPAWN_CHUNK,
            self.config.spawn_radius,
            self.tick_interval(),
            &self.cancel_token,
        )
        .await?;
        if outcome == SpawnOutcome::Ready {
            log::info!("Started Steel Server");
        }

        let chunks = Arc::clone(&self.chunks);
        let cancel_token = self.cancel_token.clone();
        let mut interval = tokio::time::interval(self.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = interval.tick() => chunks.tick(),
                }
            }
            log::debug!("Tick loop stopped after tick {}", chunks.manager().current_tick());
        }))
    }

    /// Stops the tick loop.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Saves every chunk and closes the chunk system.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        if !self.config.debug_dump.is_empty() {
            let dump = serde_json::to_string_pretty(&self.chunks.debug_json())?;
            fs::write(&self.config.debug_dump, dump)?;
            log::info!("Wrote chunk system dump to {}", self.config.debug_dump);
        }
        self.chunks.close(true)?;
        log::info!("Stopped Steel Server");
        Ok(())
    }
}
