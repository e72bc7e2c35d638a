//! This module contains the `ChunkGenerator` trait, which produces the data of each stage.

use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use steel_utils::ChunkPos;

use crate::chunk::{
    chunk_artifact::ChunkArtifact, chunk_status::ChunkStatus,
    flat_chunk_generator::FlatChunkGenerator,
};

/// Read-only view of the neighbours a stage depends on.
pub struct NeighbourArtifacts {
    center: ChunkPos,
    radius: u8,
    artifacts: Vec<Option<Arc<ChunkArtifact>>>,
}

impl NeighbourArtifacts {
    /// Builds a view from artifacts laid out row by row, `z` outer and `x` inner.
    #[must_use]
    pub fn new(center: ChunkPos, radius: u8, artifacts: Vec<Option<Arc<ChunkArtifact>>>) -> Self {
        debug_assert_eq!(artifacts.len(), Self::area(radius));
        Self {
            center,
            radius,
            artifacts,
        }
    }

    /// A view with no neighbours.
    #[must_use]
    pub fn none(center: ChunkPos) -> Self {
        Self {
            center,
            radius: 0,
            artifacts: Vec::new(),
        }
    }

    pub(crate) fn area(radius: u8) -> usize {
        let side = usize::from(radius) * 2 + 1;
        side * side
    }

    /// Chunk the view is centred on.
    #[must_use]
    pub fn center(&self) -> ChunkPos {
        self.center
    }

    /// Radius of the view.
    #[must_use]
    pub fn radius(&self) -> u8 {
        self.radius
    }

    /// Artifact at the offset from the centre, if present and within the radius.
    #[must_use]
    pub fn get(&self, dx: i32, dz: i32) -> Option<&ChunkArtifact> {
        let radius = i32::from(self.radius);
        if dx.abs() > radius || dz.abs() > radius {
            return None;
        }
        let side = radius * 2 + 1;
        let index = usize::try_from((dz + radius) * side + dx + radius).ok()?;
        self.artifacts.get(index)?.as_deref()
    }
}

/// A trait for generating chunks one stage at a time.
#[enum_dispatch]
pub trait ChunkGenerator: Send + Sync {
    /// Produces the artifact of `stage` for `pos`.
    ///
    /// `previous` is the chunk's own artifact from the stage before, `None` for
    /// [`ChunkStatus::Empty`]. Stages with a neighbour radius also see the
    /// neighbours' artifacts.
    fn generate_stage(
        &self,
        pos: ChunkPos,
        stage: ChunkStatus,
        previous: Option<&ChunkArtifact>,
        neighbours: &NeighbourArtifacts,
    ) -> anyhow::Result<ChunkArtifact>;
}

/// Adapts a user-supplied generator to [`ChunkGeneratorType`].
#[derive(Clone)]
pub struct CustomChunkGenerator(Arc<dyn ChunkGenerator>);

impl CustomChunkGenerator {
    /// Wraps a generator.
    #[must_use]
    pub fn new(generator: Arc<dyn ChunkGenerator>) -> Self {
        Self(generator)
    }
}

impl ChunkGenerator for CustomChunkGenerator {
    fn generate_stage(
        &self,
        pos: ChunkPos,
        stage: ChunkStatus,
        previous: Option<&ChunkArtifact>,
        neighbours: &NeighbourArtifacts,
    ) -> anyhow::Result<ChunkArtifact> {
        self.0.generate_stage(pos, stage, previous, neighbours)
    }
}

#[allow(missing_docs)]
#[enum_dispatch(ChunkGenerator)]
pub enum ChunkGeneratorType {
    Flat(FlatChunkGenerator),
    Custom(CustomChunkGenerator),
}
