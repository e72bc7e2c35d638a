//! Blob storage that never touches the disk.
//!
//! Used for tests and for worlds that are thrown away on shutdown, such as
//! minigame arenas.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use rustc_hash::FxHashMap;
use steel_utils::{ChunkPos, locks::SyncRwLock};

use super::storage::BlobStorage;

/// In-memory chunk storage.
///
/// Blobs live until the storage is dropped. Read and write counts are kept
/// so callers can observe how often storage was hit.
#[derive(Default)]
pub struct RamOnlyStorage {
    blobs: SyncRwLock<FxHashMap<i64, Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamOnlyStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a blob was stored for `pos`.
    #[must_use]
    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.blobs.read().contains_key(&pos.as_i64())
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns true if nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Number of reads served so far.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of writes performed so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlobStorage for RamOnlyStorage {
    fn read_blob(&self, pos: ChunkPos) -> io::Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.blobs.read().get(&pos.as_i64()).cloned())
    }

    fn write_blob(&self, pos: ChunkPos, blob: &[u8]) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blobs.write().insert(pos.as_i64(), blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_reads_and_writes() {
        let storage = RamOnlyStorage::new();
        let pos = ChunkPos::new(2, -3);
        assert_eq!(storage.read_blob(pos).expect("read"), None);
        storage.write_blob(pos, &[1, 2, 3]).expect("write");
        storage.write_blob(pos, &[4]).expect("write");
        assert_eq!(storage.read_blob(pos).expect("read"), Some(vec![4]));
        assert!(storage.contains(pos));
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.read_count(), 2);
        assert_eq!(storage.write_count(), 2);
    }
}
