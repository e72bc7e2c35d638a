//! Disk storage with one directory per region and one compressed file per chunk.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use steel_utils::ChunkPos;

use super::storage::BlobStorage;

/// Stores each chunk as `r.<rx>.<rz>/c.<x>.<z>.zst` below a root directory.
pub struct RegionFileStorage {
    root: PathBuf,
    region_shift: u32,
    compression_level: i32,
}

impl RegionFileStorage {
    /// Opens (creating if needed) storage rooted at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        region_shift: u32,
        compression_level: i32,
    ) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::debug!("Opened region storage at {}", root.display());
        Ok(Self {
            root,
            region_shift,
            compression_level,
        })
    }

    /// Directory holding the region directories.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn region_dir(&self, pos: ChunkPos) -> PathBuf {
        let region = pos.region(self.region_shift);
        self.root.join(format!("r.{}.{}", region.x, region.z))
    }

    fn chunk_path(&self, pos: ChunkPos) -> PathBuf {
        self.region_dir(pos)
            .join(format!("c.{}.{}.zst", pos.x, pos.z))
    }
}

impl BlobStorage for RegionFileStorage {
    fn read_blob(&self, pos: ChunkPos) -> io::Result<Option<Vec<u8>>> {
        let compressed = match fs::read(self.chunk_path(pos)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        zstd::decode_all(compressed.as_slice()).map(Some)
    }

    fn write_blob(&self, pos: ChunkPos, blob: &[u8]) -> io::Result<()> {
        fs::create_dir_all(self.region_dir(pos))?;
        let path = self.chunk_path(pos);
        let compressed = zstd::encode_all(blob, self.compression_level)?;
        // Readers never see a half-written file, and the data is on disk
        // before it replaces the old file.
        let tmp = path.with_extension("zst.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&compressed)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn temp_root() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "steel-region-storage-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn test_missing_chunk_reads_none() {
        let root = temp_root();
        let storage = RegionFileStorage::open(&root, 5, 3).expect("open");
        assert!(storage.read_blob(ChunkPos::new(3, 4)).expect("read").is_none());
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_write_then_read() {
        let root = temp_root();
        let storage = RegionFileStorage::open(&root, 5, 3).expect("open");
        let pos = ChunkPos::new(-33, 40);
        storage.write_blob(pos, &[7; 4096]).expect("write");
        storage.write_blob(pos, b"second").expect("overwrite");
        assert_eq!(
            storage.read_blob(pos).expect("read").as_deref(),
            Some(&b"second"[..])
        );
        let region = root.join("r.-2.1");
        assert!(region.join("c.-33.40.zst").exists());
        assert!(!region.join("c.-33.40.zst.tmp").exists());
        fs::remove_dir_all(root).ok();
    }
}
