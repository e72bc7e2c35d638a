//! Chunk storage abstraction.
//!
//! This module provides the `ChunkStorage` enum which abstracts chunk persistence.
//! Variants can store chunks on disk (via `RegionFileStorage`), in memory
//! (via `RamOnlyStorage`) or in any user-supplied [`BlobStorage`].

use std::{io, sync::Arc};

use steel_utils::ChunkPos;

use super::{ram_only::RamOnlyStorage, region_storage::RegionFileStorage};

/// Byte-level persistence of chunk blobs.
///
/// Calls for chunks of one region are never made concurrently; calls for
/// different regions may be.
pub trait BlobStorage: Send + Sync {
    /// Reads the blob stored for `pos`, `None` if nothing was stored.
    fn read_blob(&self, pos: ChunkPos) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the blob stored for `pos`.
    fn write_blob(&self, pos: ChunkPos, blob: &[u8]) -> io::Result<()>;

    /// Makes every completed write durable.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Chunk storage backend.
pub enum ChunkStorage {
    /// Disk-based storage using one directory per region.
    Disk(RegionFileStorage),
    /// In-memory storage for testing and minigames.
    RamOnly(RamOnlyStorage),
    /// Storage supplied by the embedder.
    Custom(Arc<dyn BlobStorage>),
}

impl ChunkStorage {
    /// Loads a chunk's blob.
    ///
    /// Returns `Ok(None)` if the chunk doesn't exist in storage.
    pub fn read_blob(&self, pos: ChunkPos) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Disk(disk) => disk.read_blob(pos),
            Self::RamOnly(ram) => ram.read_blob(pos),
            Self::Custom(custom) => custom.read_blob(pos),
        }
    }

    /// Saves a chunk's blob.
    pub fn write_blob(&self, pos: ChunkPos, blob: &[u8]) -> io::Result<()> {
        match self {
            Self::Disk(disk) => disk.write_blob(pos, blob),
            Self::RamOnly(ram) => ram.write_blob(pos, blob),
            Self::Custom(custom) => custom.write_blob(pos, blob),
        }
    }

    /// Flushes all written data.
    pub fn flush(&self) -> io::Result<()> {
        match self {
            Self::Disk(disk) => disk.flush(),
            Self::RamOnly(_) => Ok(()), // No-op for RAM storage
            Self::Custom(custom) => custom.flush(),
        }
    }
}
