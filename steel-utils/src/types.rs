// Wrapper types making it harder to accidentaly use the wrong underlying type.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Default number of bits a chunk coordinate is shifted by to get its region shard.
pub const REGION_SHIFT: u32 = 5;

/// A chunk position.
///
/// Packs into an `i64` as `(z << 32) | (x as u32)`; the packing is bijective so
/// the packed value is used as the map key everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkPos {
    /// The chunk x coordinate.
    pub x: i32,
    /// The chunk z coordinate.
    pub z: i32,
}

impl ChunkPos {
    /// Creates a new chunk position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Packs the position into a single `i64`.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        ((self.z as i64) << 32) | (self.x as u32 as i64)
    }

    /// Unpacks a position previously packed with [`ChunkPos::as_i64`].
    #[must_use]
    pub const fn from_i64(key: i64) -> Self {
        Self {
            x: key as i32,
            z: (key >> 32) as i32,
        }
    }

    /// Chebyshev (chessboard) distance between two positions.
    #[must_use]
    pub fn chebyshev_distance(self, other: Self) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dz = self.z.abs_diff(other.z);
        dx.max(dz)
    }

    /// Returns the region shard this chunk belongs to.
    #[must_use]
    pub const fn region(self, shift: u32) -> Self {
        Self {
            x: self.x >> shift,
            z: self.z >> shift,
        }
    }

    /// Packed key of the region shard this chunk belongs to.
    #[must_use]
    pub const fn region_key(self, shift: u32) -> i64 {
        self.region(shift).as_i64()
    }

    /// Iterates every position within `radius` (Chebyshev) of this one, including itself.
    pub fn square(self, radius: i32) -> impl Iterator<Item = ChunkPos> {
        (-radius..=radius).flat_map(move |dz| {
            (-radius..=radius).map(move |dx| ChunkPos::new(self.x + dx, self.z + dz))
        })
    }

    /// The eight positions adjacent to this one.
    #[must_use]
    pub fn neighbours(self) -> [ChunkPos; 8] {
        [
            ChunkPos::new(self.x - 1, self.z - 1),
            ChunkPos::new(self.x, self.z - 1),
            ChunkPos::new(self.x + 1, self.z - 1),
            ChunkPos::new(self.x - 1, self.z),
            ChunkPos::new(self.x + 1, self.z),
            ChunkPos::new(self.x - 1, self.z + 1),
            ChunkPos::new(self.x, self.z + 1),
            ChunkPos::new(self.x + 1, self.z + 1),
        ]
    }
}

impl PartialOrd for ChunkPos {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkPos {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_i64().cmp(&other.as_i64())
    }
}

impl Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing_roundtrips_extremes() {
        for (x, z) in [(0, 0), (-1, -1), (i32::MIN, i32::MAX), (i32::MAX, i32::MIN), (5, -7)] {
            let pos = ChunkPos::new(x, z);
            assert_eq!(ChunkPos::from_i64(pos.as_i64()), pos);
        }
    }

    #[test]
    fn test_packing_is_distinct_for_swapped_coords() {
        assert_ne!(ChunkPos::new(1, 2).as_i64(), ChunkPos::new(2, 1).as_i64());
        assert_ne!(ChunkPos::new(-1, 0).as_i64(), ChunkPos::new(0, -1).as_i64());
    }

    #[test]
    fn test_region_of_negative_coords() {
        assert_eq!(ChunkPos::new(-1, -32).region(5), ChunkPos::new(-1, -1));
        assert_eq!(ChunkPos::new(31, 32).region(5), ChunkPos::new(0, 1));
    }

    #[test]
    fn test_chebyshev_distance() {
        let a = ChunkPos::new(0, 0);
        assert_eq!(a.chebyshev_distance(ChunkPos::new(2, 0)), 2);
        assert_eq!(a.chebyshev_distance(ChunkPos::new(-3, 2)), 3);
        assert_eq!(a.chebyshev_distance(a), 0);
    }

    #[test]
    fn test_square_covers_area() {
        let center = ChunkPos::new(10, -4);
        let all: Vec<_> = center.square(2).collect();
        assert_eq!(all.len(), 25);
        assert!(all.iter().all(|p| p.chebyshev_distance(center) <= 2));
    }
}
