use anyhow::ensure;
use steel_utils::ChunkPos;

use crate::chunk::{
    chunk_artifact::ChunkArtifact,
    chunk_generator::{ChunkGenerator, NeighbourArtifacts},
    chunk_status::ChunkStatus,
};

/// Number of columns in one layer of a flat chunk.
pub const LAYER_SIZE: usize = 16 * 16;

/// A chunk generator that generates a flat world.
///
/// The payload is a stack of layers, bottom first, each holding one block id
/// per column in `z * 16 + x` order.
pub struct FlatChunkGenerator {
    /// The block id for bedrock.
    pub bedrock: u8,
    /// The block id for dirt.
    pub dirt: u8,
    /// The block id for grass blocks.
    pub grass: u8,
    /// The block id for torch.
    pub torch: u8,
}

impl FlatChunkGenerator {
    /// Creates a new `FlatChunkGenerator`.
    #[must_use]
    pub fn new(bedrock: u8, dirt: u8, grass: u8, torch: u8) -> Self {
        Self {
            bedrock,
            dirt,
            grass,
            torch,
        }
    }

    fn fill_from_noise(&self) -> Vec<u8> {
        // Layers:
        // 0: Bedrock
        // 1-2: Dirt
        // 3: Grass Block
        let mut data = Vec::with_capacity(LAYER_SIZE * 5);
        for block in [self.bedrock, self.dirt, self.dirt, self.grass] {
            data.extend(std::iter::repeat_n(block, LAYER_SIZE));
        }
        data
    }

    fn decorate(&self, previous: &[u8]) -> Vec<u8> {
        let mut data = previous.to_vec();
        let mut top = vec![0; LAYER_SIZE];
        top[0] = self.torch;
        data.extend(top);
        data
    }
}

impl ChunkGenerator for FlatChunkGenerator {
    fn generate_stage(
        &self,
        pos: ChunkPos,
        stage: ChunkStatus,
        previous: Option<&ChunkArtifact>,
        neighbours: &NeighbourArtifacts,
    ) -> anyhow::Result<ChunkArtifact> {
        let radius = i32::from(stage.neighbour_radius());
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                if dx == 0 && dz == 0 {
                    continue;
                }
                let neighbour = neighbours.get(dx, dz);
                ensure!(
                    neighbour.is_some_and(|n| stage.previous().is_none_or(|p| n.status >= p)),
                    "neighbour ({dx}, {dz}) of {pos} is not ready for {}",
                    stage.name()
                );
            }
        }

        let previous_data = previous.map_or(&[][..], |artifact| artifact.data.as_slice());
        let data = match stage {
            ChunkStatus::Noise => self.fill_from_noise(),
            ChunkStatus::Features => self.decorate(previous_data),
            _ => previous_data.to_vec(),
        };
        Ok(ChunkArtifact::new(pos, stage, data))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn generator() -> FlatChunkGenerator {
        FlatChunkGenerator::new(1, 2, 3, 4)
    }

    #[test]
    fn test_noise_fills_layers() {
        let pos = ChunkPos::new(0, 0);
        let previous = ChunkArtifact::new(pos, ChunkStatus::Biomes, Vec::new());
        let artifact = generator()
            .generate_stage(
                pos,
                ChunkStatus::Noise,
                Some(&previous),
                &NeighbourArtifacts::none(pos),
            )
            .expect("noise has no neighbours");
        assert_eq!(artifact.data.len(), LAYER_SIZE * 4);
        assert_eq!(artifact.data[0], 1);
        assert_eq!(artifact.data[LAYER_SIZE * 3], 3);
    }

    #[test]
    fn test_features_needs_neighbours() {
        let pos = ChunkPos::new(0, 0);
        let previous = ChunkArtifact::new(pos, ChunkStatus::Carvers, vec![9; LAYER_SIZE]);
        let err = generator().generate_stage(
            pos,
            ChunkStatus::Features,
            Some(&previous),
            &NeighbourArtifacts::none(pos),
        );
        assert!(err.is_err());

        let ready = Arc::new(previous.clone());
        let neighbours = NeighbourArtifacts::new(pos, 1, vec![Some(ready); 9]);
        let artifact = generator()
            .generate_stage(pos, ChunkStatus::Features, Some(&previous), &neighbours)
            .expect("neighbours ready");
        assert_eq!(artifact.data.len(), LAYER_SIZE * 2);
        assert_eq!(artifact.data[LAYER_SIZE], 4);
    }
}
