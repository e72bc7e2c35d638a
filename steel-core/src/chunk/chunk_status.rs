//! Generation pipeline stages.

use serde::{Deserialize, Serialize};

/// A stage of the chunk pipeline, in generation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// Nothing generated yet.
    Empty,
    /// Structure starts placed.
    StructureStarts,
    /// Structure references resolved.
    StructureReferences,
    /// Biomes assigned.
    Biomes,
    /// Terrain shape filled from noise.
    Noise,
    /// Surface built.
    Surface,
    /// Carvers applied.
    Carvers,
    /// Features decorated, reads its neighbours.
    Features,
    /// Light sources initialised.
    InitializeLight,
    /// Light propagated, reads its neighbours.
    Light,
    /// Initial entities spawned.
    Spawn,
    /// Fully generated and usable.
    Full,
}

impl ChunkStatus {
    /// Every stage in pipeline order.
    pub const ALL: [ChunkStatus; 12] = [
        ChunkStatus::Empty,
        ChunkStatus::StructureStarts,
        ChunkStatus::StructureReferences,
        ChunkStatus::Biomes,
        ChunkStatus::Noise,
        ChunkStatus::Surface,
        ChunkStatus::Carvers,
        ChunkStatus::Features,
        ChunkStatus::InitializeLight,
        ChunkStatus::Light,
        ChunkStatus::Spawn,
        ChunkStatus::Full,
    ];

    /// Index of the stage in [`ChunkStatus::ALL`].
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Looks up a stage by its id.
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(id)).copied()
    }

    /// The stage before this one.
    #[must_use]
    pub fn previous(self) -> Option<Self> {
        self.id().checked_sub(1).and_then(Self::from_id)
    }

    /// The stage after this one.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::from_id(self.id() + 1)
    }

    /// Radius of neighbours that must have reached [`ChunkStatus::previous`]
    /// before this stage can run.
    #[must_use]
    pub const fn neighbour_radius(self) -> u8 {
        match self {
            ChunkStatus::Features | ChunkStatus::Light => 1,
            _ => 0,
        }
    }

    /// Lowercase name, as used in logs and debug dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ChunkStatus::Empty => "empty",
            ChunkStatus::StructureStarts => "structure_starts",
            ChunkStatus::StructureReferences => "structure_references",
            ChunkStatus::Biomes => "biomes",
            ChunkStatus::Noise => "noise",
            ChunkStatus::Surface => "surface",
            ChunkStatus::Carvers => "carvers",
            ChunkStatus::Features => "features",
            ChunkStatus::InitializeLight => "initialize_light",
            ChunkStatus::Light => "light",
            ChunkStatus::Spawn => "spawn",
            ChunkStatus::Full => "full",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_and_next() {
        assert_eq!(ChunkStatus::Empty.previous(), None);
        assert_eq!(ChunkStatus::Full.next(), None);
        assert_eq!(ChunkStatus::Features.previous(), Some(ChunkStatus::Carvers));
        assert_eq!(ChunkStatus::Spawn.next(), Some(ChunkStatus::Full));
    }

    #[test]
    fn test_ids_match_order() {
        for (i, status) in ChunkStatus::ALL.iter().enumerate() {
            assert_eq!(usize::from(status.id()), i);
            assert_eq!(ChunkStatus::from_id(status.id()), Some(*status));
        }
        assert_eq!(ChunkStatus::from_id(12), None);
    }
}
