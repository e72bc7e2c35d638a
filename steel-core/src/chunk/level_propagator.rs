//! Batched level propagation over the 8-connected chunk grid.
//!
//! Every coordinate's level is `min(source, min(neighbour) + step)`, clamped
//! to the maximum level. Source changes are queued and applied together by
//! [`LevelPropagator::propagate_updates`]: a decrease phase first clears every
//! level that may have depended on a raised or removed source, then an
//! increase phase re-fills the cleared area from its boundary and from the
//! new sources in order of ascending level. Only coordinates whose level can
//! change are visited.
//!
//! Nodes live in a flat arena indexed through a coordinate map; freed slots
//! form an intrusive free list.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
    mem,
};

use rustc_hash::FxHashMap;
use steel_utils::ChunkPos;

const NO_FREE_SLOT: u32 = u32::MAX;

/// A coordinate whose propagated level changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChange {
    /// The coordinate.
    pub pos: ChunkPos,
    /// Level before the batch.
    pub old_level: u8,
    /// Level after the batch.
    pub new_level: u8,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    level: u8,
    source: u8,
}

/// Propagates ticket levels outward from their sources.
pub struct LevelPropagator {
    nodes: Vec<Result<Node, u32>>,
    free_head: u32,
    index: FxHashMap<i64, u32>,
    pending: FxHashMap<i64, u8>,
    step: u8,
    max: u8,
}

impl LevelPropagator {
    /// Creates a propagator; levels at or above `max` mean "no level".
    #[must_use]
    pub fn new(step: u8, max: u8) -> Self {
        Self {
            nodes: Vec::new(),
            free_head: NO_FREE_SLOT,
            index: FxHashMap::default(),
            pending: FxHashMap::default(),
            step: step.max(1),
            max,
        }
    }

    /// The maximum ("unloaded") level.
    #[must_use]
    pub fn max_level(&self) -> u8 {
        self.max
    }

    /// Current propagated level at `pos`, as of the last batch.
    #[must_use]
    pub fn level(&self, pos: ChunkPos) -> u8 {
        self.level_of(pos.as_i64())
    }

    /// Source level applied at `pos`, as of the last batch.
    #[must_use]
    pub fn source(&self, pos: ChunkPos) -> u8 {
        self.node(pos.as_i64()).map_or(self.max, |node| node.source)
    }

    /// Queues a new source level for `pos`; `level >= max` removes the source.
    pub fn set_source(&mut self, pos: ChunkPos, level: u8) {
        self.pending.insert(pos.as_i64(), level.min(self.max));
    }

    /// Queues removal of the source at `pos`.
    pub fn remove_source(&mut self, pos: ChunkPos) {
        self.set_source(pos, self.max);
    }

    /// Returns true if source changes are waiting for the next batch.
    #[must_use]
    pub fn has_pending_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of coordinates with a level or a source.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if no coordinate has a level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn node(&self, key: i64) -> Option<&Node> {
        let slot = *self.index.get(&key)?;
        self.nodes.get(slot as usize).and_then(|entry| entry.as_ref().ok())
    }

    fn node_mut(&mut self, key: i64) -> Option<&mut Node> {
        let slot = *self.index.get(&key)?;
        self.nodes
            .get_mut(slot as usize)
            .and_then(|entry| entry.as_mut().ok())
    }

    fn level_of(&self, key: i64) -> u8 {
        self.node(key).map_or(self.max, |node| node.level)
    }

    fn node_or_insert(&mut self, key: i64) -> &mut Node {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let node = Node {
                    level: self.max,
                    source: self.max,
                };
                let slot = if self.free_head == NO_FREE_SLOT {
                    self.nodes.push(Ok(node));
                    (self.nodes.len() - 1) as u32
                } else {
                    let slot = self.free_head;
                    let next = mem::replace(&mut self.nodes[slot as usize], Ok(node));
                    self.free_head = next.err().unwrap_or(NO_FREE_SLOT);
                    slot
                };
                self.index.insert(key, slot);
                slot
            }
        };
        match &mut self.nodes[slot as usize] {
            Ok(node) => node,
            Err(_) => unreachable!("index points at a free slot"),
        }
    }

    fn release_if_unused(&mut self, key: i64) {
        let Some(&slot) = self.index.get(&key) else {
            return;
        };
        let unused = matches!(
            self.nodes[slot as usize],
            Ok(node) if node.level >= self.max && node.source >= self.max
        );
        if unused {
            self.nodes[slot as usize] = Err(self.free_head);
            self.free_head = slot;
            self.index.remove(&key);
        }
    }

    fn relax_neighbours(&self, key: i64, level: u8, queue: &mut BinaryHeap<Reverse<(u8, i64)>>) {
        let candidate = level.saturating_add(self.step);
        if candidate >= self.max {
            return;
        }
        for neighbour in ChunkPos::from_i64(key).neighbours() {
            let neighbour = neighbour.as_i64();
            if self.level_of(neighbour) > candidate {
                queue.push(Reverse((candidate, neighbour)));
            }
        }
    }

    /// Applies every queued source change and returns the coordinates whose
    /// level changed, ordered by coordinate key.
    pub fn propagate_updates(&mut self) -> Vec<LevelChange> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let pending: Vec<(i64, u8)> = mem::take(&mut self.pending).into_iter().collect();
        let max = self.max;
        let step = self.step;

        let mut original: FxHashMap<i64, u8> = FxHashMap::default();
        let mut decrease: VecDeque<(i64, u8)> = VecDeque::new();
        let mut increase: BinaryHeap<Reverse<(u8, i64)>> = BinaryHeap::new();
        let mut boundary: Vec<i64> = Vec::new();

        for &(key, new_source) in &pending {
            let node = self.node_or_insert(key);
            let old_source = mem::replace(&mut node.source, new_source);
            let level = node.level;
            if new_source < level {
                increase.push(Reverse((new_source, key)));
            } else if new_source > old_source && level == old_source && level < max {
                // The level may have been held up by the old source alone.
                node.level = max;
                original.entry(key).or_insert(level);
                decrease.push_back((key, level));
                if new_source < max {
                    increase.push(Reverse((new_source, key)));
                }
            }
        }

        while let Some((key, old_level)) = decrease.pop_front() {
            let dependent_level = old_level.saturating_add(step);
            for neighbour in ChunkPos::from_i64(key).neighbours() {
                let neighbour = neighbour.as_i64();
                let Some(node) = self.node_mut(neighbour) else {
                    continue;
                };
                if node.level >= max {
                    continue;
                }
                if node.level == dependent_level && node.source != node.level {
                    let level = mem::replace(&mut node.level, max);
                    let source = node.source;
                    original.entry(neighbour).or_insert(level);
                    decrease.push_back((neighbour, level));
                    if source < max {
                        increase.push(Reverse((source, neighbour)));
                    }
                } else {
                    boundary.push(neighbour);
                }
            }
        }

        for key in boundary {
            let level = self.level_of(key);
            if level < max {
                self.relax_neighbours(key, level, &mut increase);
            }
        }

        while let Some(Reverse((level, key))) = increase.pop() {
            let node = self.node_or_insert(key);
            if level >= node.level {
                continue;
            }
            let previous = mem::replace(&mut node.level, level);
            original.entry(key).or_insert(previous);
            self.relax_neighbours(key, level, &mut increase);
        }

        let mut changes: Vec<LevelChange> = original
            .iter()
            .filter_map(|(&key, &old_level)| {
                let new_level = self.level_of(key);
                (new_level != old_level).then(|| LevelChange {
                    pos: ChunkPos::from_i64(key),
                    old_level,
                    new_level,
                })
            })
            .collect();
        changes.sort_unstable_by_key(|change| change.pos);

        for key in original.into_keys().chain(pending.into_iter().map(|(key, _)| key)) {
            self.release_if_unused(key);
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    const MAX: u8 = 45;

    fn brute_force(sources: &FxHashMap<ChunkPos, u8>, pos: ChunkPos, step: u8) -> u8 {
        sources
            .iter()
            .map(|(source, &level)| {
                let distance = source.chebyshev_distance(pos);
                u32::from(level) + distance * u32::from(step)
            })
            .min()
            .map_or(MAX, |level| level.min(u32::from(MAX)) as u8)
    }

    #[test]
    fn test_single_source_spreads_by_distance() {
        let mut propagator = LevelPropagator::new(1, MAX);
        propagator.set_source(ChunkPos::new(0, 0), 40);
        let changes = propagator.propagate_updates();
        // Levels 40..=44 cover a 9x9 square.
        assert_eq!(changes.len(), 81);
        assert_eq!(propagator.level(ChunkPos::new(0, 0)), 40);
        assert_eq!(propagator.level(ChunkPos::new(3, -2)), 43);
        assert_eq!(propagator.level(ChunkPos::new(4, 4)), 44);
        assert_eq!(propagator.level(ChunkPos::new(5, 0)), MAX);
    }

    #[test]
    fn test_removal_clears_everything() {
        let mut propagator = LevelPropagator::new(1, MAX);
        propagator.set_source(ChunkPos::new(2, 2), 42);
        propagator.propagate_updates();
        propagator.remove_source(ChunkPos::new(2, 2));
        let changes = propagator.propagate_updates();
        assert_eq!(changes.len(), 25);
        assert!(changes.iter().all(|change| change.new_level == MAX));
        assert!(propagator.is_empty());
    }

    #[test]
    fn test_removal_keeps_other_source() {
        let mut propagator = LevelPropagator::new(1, MAX);
        propagator.set_source(ChunkPos::new(0, 0), 40);
        propagator.set_source(ChunkPos::new(3, 0), 41);
        propagator.propagate_updates();
        assert_eq!(propagator.level(ChunkPos::new(2, 0)), 42);

        propagator.remove_source(ChunkPos::new(0, 0));
        let changes = propagator.propagate_updates();
        assert_eq!(propagator.level(ChunkPos::new(2, 0)), 42);
        assert_eq!(propagator.level(ChunkPos::new(1, 0)), 43);
        assert_eq!(propagator.level(ChunkPos::new(0, 0)), 44);
        assert_eq!(propagator.level(ChunkPos::new(-1, 0)), MAX);
        assert!(!changes.iter().any(|change| change.pos == ChunkPos::new(2, 0)));
    }

    #[test]
    fn test_raise_source_level() {
        let mut propagator = LevelPropagator::new(2, MAX);
        propagator.set_source(ChunkPos::new(0, 0), 30);
        propagator.propagate_updates();
        assert_eq!(propagator.level(ChunkPos::new(3, 1)), 36);

        propagator.set_source(ChunkPos::new(0, 0), 38);
        propagator.propagate_updates();
        assert_eq!(propagator.level(ChunkPos::new(0, 0)), 38);
        assert_eq!(propagator.level(ChunkPos::new(3, 1)), 44);
        assert_eq!(propagator.level(ChunkPos::new(4, 0)), MAX);
    }

    #[test]
    fn test_free_slots_are_reused() {
        let mut propagator = LevelPropagator::new(1, MAX);
        propagator.set_source(ChunkPos::new(0, 0), 43);
        propagator.propagate_updates();
        let arena = propagator.nodes.len();
        propagator.remove_source(ChunkPos::new(0, 0));
        propagator.propagate_updates();
        propagator.set_source(ChunkPos::new(100, 100), 43);
        propagator.propagate_updates();
        assert_eq!(propagator.nodes.len(), arena);
    }

    #[test]
    fn test_random_batches_match_brute_force() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for step in [1, 2, 3] {
            let mut propagator = LevelPropagator::new(step, MAX);
            let mut sources: FxHashMap<ChunkPos, u8> = FxHashMap::default();
            for _ in 0..40 {
                for _ in 0..rng.random_range(1..6) {
                    let pos = ChunkPos::new(rng.random_range(-6..=6), rng.random_range(-6..=6));
                    if rng.random_bool(0.35) {
                        sources.remove(&pos);
                        propagator.remove_source(pos);
                    } else {
                        let level = rng.random_range(30..MAX);
                        sources.insert(pos, level);
                        propagator.set_source(pos, level);
                    }
                }
                propagator.propagate_updates();
                for pos in ChunkPos::new(0, 0).square(24) {
                    assert_eq!(
                        propagator.level(pos),
                        brute_force(&sources, pos, step),
                        "level mismatch at {pos} with step {step}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_changes_report_old_and_new() {
        let mut propagator = LevelPropagator::new(1, MAX);
        propagator.set_source(ChunkPos::new(0, 0), 44);
        let changes = propagator.propagate_updates();
        assert_eq!(
            changes,
            vec![LevelChange {
                pos: ChunkPos::new(0, 0),
                old_level: MAX,
                new_level: 44,
            }]
        );
    }
}
