//! The data a chunk has produced so far.

use steel_utils::ChunkPos;

use crate::{chunk::chunk_status::ChunkStatus, error::ChunkError};

const BLOB_MAGIC: u8 = 0x5C;

/// Output of the last stage a chunk completed.
///
/// The payload is opaque to the chunk system; generators decide what it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkArtifact {
    /// Coordinate the data belongs to.
    pub pos: ChunkPos,
    /// Last stage that produced this data.
    pub status: ChunkStatus,
    /// Generator-defined payload.
    pub data: Vec<u8>,
}

impl ChunkArtifact {
    /// Creates an artifact.
    #[must_use]
    pub fn new(pos: ChunkPos, status: ChunkStatus, data: Vec<u8>) -> Self {
        Self { pos, status, data }
    }

    /// An artifact at [`ChunkStatus::Empty`] with no data.
    #[must_use]
    pub fn empty(pos: ChunkPos) -> Self {
        Self::new(pos, ChunkStatus::Empty, Vec::new())
    }

    /// Serializes the artifact into a storage blob.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.data.len() + 2);
        blob.push(BLOB_MAGIC);
        blob.push(self.status.id());
        blob.extend_from_slice(&self.data);
        blob
    }

    /// Parses a blob written by [`ChunkArtifact::to_blob`].
    pub fn from_blob(pos: ChunkPos, blob: &[u8]) -> Result<Self, ChunkError> {
        let [magic, status, data @ ..] = blob else {
            return Err(ChunkError::Corrupt {
                pos,
                reason: format!("blob too short ({} bytes)", blob.len()),
            });
        };
        if *magic != BLOB_MAGIC {
            return Err(ChunkError::Corrupt {
                pos,
                reason: format!("bad magic byte {magic:#04x}"),
            });
        }
        let status = ChunkStatus::from_id(*status).ok_or_else(|| ChunkError::Corrupt {
            pos,
            reason: format!("unknown status id {status}"),
        })?;
        Ok(Self::new(pos, status, data.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_keeps_status_and_data() {
        let pos = ChunkPos::new(-4, 9);
        let artifact = ChunkArtifact::new(pos, ChunkStatus::Light, vec![1, 2, 3]);
        let parsed = ChunkArtifact::from_blob(pos, &artifact.to_blob()).expect("valid blob");
        assert_eq!(parsed, artifact);
    }

    #[test]
    fn test_corrupt_blobs() {
        let pos = ChunkPos::new(0, 0);
        assert!(matches!(
            ChunkArtifact::from_blob(pos, &[BLOB_MAGIC]),
            Err(ChunkError::Corrupt { .. })
        ));
        assert!(matches!(
            ChunkArtifact::from_blob(pos, &[0, 0]),
            Err(ChunkError::Corrupt { .. })
        ));
        assert!(matches!(
            ChunkArtifact::from_blob(pos, &[BLOB_MAGIC, 200]),
            Err(ChunkError::Corrupt { .. })
        ));
    }
}
