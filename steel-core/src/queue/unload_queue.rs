//! Chunks waiting to be unloaded, grouped into region sections.
//!
//! Sections remember when they were created so unloading can work through
//! the oldest sections first, keeping unloads of one region together.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use rustc_hash::FxHashMap;
use scc::HashMap;
use steel_utils::ChunkPos;

/// A section with chunks queued for unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionToUnload {
    /// Section x, in section coordinates.
    pub section_x: i32,
    /// Section z, in section coordinates.
    pub section_z: i32,
    /// Creation order of the section.
    pub order: u64,
    /// Number of queued chunks.
    pub count: usize,
}

#[derive(Debug)]
struct UnloadSection {
    order: u64,
    /// Insertion sequence to packed chunk key, oldest first.
    chunks: BTreeMap<u64, i64>,
    index: FxHashMap<i64, u64>,
    next: u64,
}

impl UnloadSection {
    fn new(order: u64) -> Self {
        Self {
            order,
            chunks: BTreeMap::new(),
            index: FxHashMap::default(),
            next: 0,
        }
    }

    fn add(&mut self, key: i64) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        let sequence = self.next;
        self.next += 1;
        self.index.insert(key, sequence);
        self.chunks.insert(sequence, key);
        true
    }

    fn remove(&mut self, key: i64) -> bool {
        match self.index.remove(&key) {
            Some(sequence) => {
                self.chunks.remove(&sequence);
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Region-sharded queue of chunks to unload.
///
/// Adding or removing chunks of one section must not race with another call
/// for the same section; different sections may be used concurrently.
pub struct ChunkUnloadQueue {
    coordinate_shift: u32,
    order_generator: AtomicU64,
    sections: HashMap<i64, UnloadSection>,
}

impl ChunkUnloadQueue {
    /// Creates a queue grouping chunks by `pos >> coordinate_shift`.
    #[must_use]
    pub fn new(coordinate_shift: u32) -> Self {
        Self {
            coordinate_shift,
            order_generator: AtomicU64::new(0),
            sections: HashMap::new(),
        }
    }

    fn section_key(&self, pos: ChunkPos) -> i64 {
        pos.region_key(self.coordinate_shift)
    }

    /// Queues `pos`. Returns false if it was already queued.
    pub fn add_chunk(&self, pos: ChunkPos) -> bool {
        let section = self.section_key(pos);
        let key = pos.as_i64();
        loop {
            if let Some(added) = self
                .sections
                .update_sync(&section, |_, chunks: &mut UnloadSection| chunks.add(key))
            {
                return added;
            }
            let order = self.order_generator.fetch_add(1, Ordering::Relaxed);
            let mut chunks = UnloadSection::new(order);
            chunks.add(key);
            if self.sections.insert_sync(section, chunks).is_ok() {
                return true;
            }
        }
    }

    /// Removes `pos` from the queue. Returns false if it was not queued.
    pub fn remove_chunk(&self, pos: ChunkPos) -> bool {
        let section = self.section_key(pos);
        let key = pos.as_i64();
        let Some((removed, empty)) = self
            .sections
            .update_sync(&section, |_, chunks: &mut UnloadSection| {
                (chunks.remove(key), chunks.is_empty())
            })
        else {
            return false;
        };
        if empty {
            let _ = self
                .sections
                .remove_if_sync(&section, |chunks| chunks.is_empty());
        }
        removed
    }

    /// Returns true if `pos` is queued.
    #[must_use]
    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.sections
            .read_sync(&self.section_key(pos), |_, chunks| {
                chunks.index.contains_key(&pos.as_i64())
            })
            .unwrap_or(false)
    }

    /// Every non-empty section, oldest first.
    #[must_use]
    pub fn retrieve_for_all_regions(&self) -> Vec<SectionToUnload> {
        let mut sections = Vec::new();
        self.sections.iter_sync(|key, chunks| {
            if !chunks.is_empty() {
                let section = ChunkPos::from_i64(*key);
                sections.push(SectionToUnload {
                    section_x: section.x,
                    section_z: section.z,
                    order: chunks.order,
                    count: chunks.index.len(),
                });
            }
            true
        });
        sections.sort_unstable_by_key(|section| section.order);
        sections
    }

    /// The queued chunks of the section containing `pos`, oldest first.
    #[must_use]
    pub fn get_section(&self, pos: ChunkPos) -> Option<Vec<ChunkPos>> {
        self.sections
            .read_sync(&self.section_key(pos), |_, chunks| {
                chunks.chunks.values().copied().map(ChunkPos::from_i64).collect()
            })
    }

    /// Drops the whole section containing `pos`, returning its chunks.
    pub fn remove_section(&self, pos: ChunkPos) -> Option<Vec<ChunkPos>> {
        self.sections
            .remove_sync(&self.section_key(pos))
            .map(|(_, chunks)| chunks.chunks.into_values().map(ChunkPos::from_i64).collect())
    }

    /// Takes up to `max` of the oldest chunks of a section.
    ///
    /// The section is removed once it runs empty.
    pub fn drain_section(&self, section_x: i32, section_z: i32, max: usize) -> Vec<ChunkPos> {
        let section = ChunkPos::new(section_x, section_z).as_i64();
        let Some((drained, empty)) =
            self.sections
                .update_sync(&section, |_, chunks: &mut UnloadSection| {
                    let mut drained = Vec::with_capacity(max.min(chunks.index.len()));
                    while drained.len() < max {
                        let Some((_, key)) = chunks.chunks.pop_first() else {
                            break;
                        };
                        chunks.index.remove(&key);
                        drained.push(ChunkPos::from_i64(key));
                    }
                    (drained, chunks.is_empty())
                })
        else {
            return Vec::new();
        };
        if empty {
            let _ = self
                .sections
                .remove_if_sync(&section, |chunks| chunks.is_empty());
        }
        drained
    }

    /// Total number of queued chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut total = 0;
        self.sections.iter_sync(|_, chunks| {
            total += chunks.index.len();
            true
        });
        total
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Dumps the queue as JSON.
    #[must_use]
    pub fn debug_json(&self) -> serde_json::Value {
        let sections: Vec<_> = self
            .retrieve_for_all_regions()
            .into_iter()
            .map(|section| {
                let chunks: Vec<_> = self
                    .get_section(ChunkPos::new(
                        section.section_x << self.coordinate_shift,
                        section.section_z << self.coordinate_shift,
                    ))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|pos| serde_json::json!({ "chunkX": pos.x, "chunkZ": pos.z }))
                    .collect();
                serde_json::json!({
                    "sectionX": section.section_x,
                    "sectionZ": section.section_z,
                    "order": section.order,
                    "chunks": chunks,
                })
            })
            .collect();
        serde_json::json!({
            "coordinate_shift": self.coordinate_shift,
            "sections": sections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_ordered_by_creation() {
        let queue = ChunkUnloadQueue::new(5);
        queue.add_chunk(ChunkPos::new(100, 100));
        queue.add_chunk(ChunkPos::new(0, 0));
        queue.add_chunk(ChunkPos::new(-40, 3));
        queue.add_chunk(ChunkPos::new(1, 1));

        let sections = queue.retrieve_for_all_regions();
        let coords: Vec<_> = sections.iter().map(|s| (s.section_x, s.section_z)).collect();
        assert_eq!(coords, vec![(3, 3), (0, 0), (-2, 0)]);
        assert!(sections.windows(2).all(|w| w[0].order < w[1].order));
        assert_eq!(sections[1].count, 2);
    }

    #[test]
    fn test_empty_sections_disappear() {
        let queue = ChunkUnloadQueue::new(5);
        let pos = ChunkPos::new(7, 7);
        assert!(queue.add_chunk(pos));
        assert!(!queue.add_chunk(pos));
        assert!(queue.remove_chunk(pos));
        assert!(!queue.remove_chunk(pos));
        assert!(queue.retrieve_for_all_regions().is_empty());
        assert!(queue.is_empty());
        assert!(queue.get_section(pos).is_none());
    }

    #[test]
    fn test_drain_section_oldest_first() {
        let queue = ChunkUnloadQueue::new(5);
        for x in 0..5 {
            queue.add_chunk(ChunkPos::new(x, 0));
        }
        assert_eq!(
            queue.drain_section(0, 0, 2),
            vec![ChunkPos::new(0, 0), ChunkPos::new(1, 0)]
        );
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain_section(0, 0, 10).len(), 3);
        assert!(queue.is_empty());
        assert!(queue.drain_section(0, 0, 10).is_empty());
    }

    #[test]
    fn test_remove_section() {
        let queue = ChunkUnloadQueue::new(5);
        queue.add_chunk(ChunkPos::new(40, 40));
        queue.add_chunk(ChunkPos::new(41, 40));
        let removed = queue.remove_section(ChunkPos::new(63, 63)).expect("section exists");
        assert_eq!(removed.len(), 2);
        assert!(!queue.contains(ChunkPos::new(40, 40)));
    }

    #[test]
    fn test_debug_json() {
        let queue = ChunkUnloadQueue::new(5);
        queue.add_chunk(ChunkPos::new(-1, -1));
        let json = queue.debug_json();
        assert_eq!(json["sections"][0]["sectionX"], -1);
        assert_eq!(json["sections"][0]["chunks"][0]["chunkZ"], -1);
    }
}
