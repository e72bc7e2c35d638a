//! Lock-striped map keyed by packed chunk coordinates.

use std::hash::BuildHasher;

use crossbeam::utils::CachePadded;
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::{ChunkPos, REGION_SHIFT, locks::SyncRwLock};

type Stripe<V> = CachePadded<SyncRwLock<FxHashMap<i64, V>>>;

/// A concurrent `i64 -> V` map split into independently locked stripes.
///
/// The stripe of a key is chosen from the key's region shard, so chunks of
/// the same region always share a stripe and nearby work tends to stay on
/// one lock. Operations on one key are linearizable; iteration visits one
/// stripe at a time and is not a global snapshot.
pub struct ShardedLongMap<V> {
    stripes: Box<[Stripe<V>]>,
    mask: usize,
    shift: u32,
}

impl<V> ShardedLongMap<V> {
    /// Creates a map with the given stripe count, rounded up to a power of two.
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self::with_shift(REGION_SHIFT, stripes)
    }

    /// Creates a map that groups keys by `pos >> shift` when picking a stripe.
    #[must_use]
    pub fn with_shift(shift: u32, stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        let stripes = (0..count)
            .map(|_| CachePadded::new(SyncRwLock::new(FxHashMap::default())))
            .collect();
        Self {
            stripes,
            mask: count - 1,
            shift,
        }
    }

    fn stripe(&self, key: i64) -> &Stripe<V> {
        let region = ChunkPos::from_i64(key).region_key(self.shift);
        let index = (FxBuildHasher.hash_one(region) as usize) & self.mask;
        &self.stripes[index]
    }

    /// Runs `f` on the value under the stripe's read lock.
    pub fn with<R>(&self, key: i64, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.stripe(key).read().get(&key).map(f)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: i64) -> bool {
        self.stripe(key).read().contains_key(&key)
    }

    /// Inserts a value, returning the previous one.
    pub fn insert(&self, key: i64, value: V) -> Option<V> {
        self.stripe(key).write().insert(key, value)
    }

    /// Removes a value.
    pub fn remove(&self, key: i64) -> Option<V> {
        self.stripe(key).write().remove(&key)
    }

    /// Mutates an existing value under the stripe's write lock.
    pub fn update<R>(&self, key: i64, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.stripe(key).write().get_mut(&key).map(f)
    }

    /// Atomically inspects and rewrites the slot of `key`.
    ///
    /// Leaving `None` in the slot removes the entry.
    pub fn compute<R>(&self, key: i64, f: impl FnOnce(&mut Option<V>) -> R) -> R {
        let mut stripe = self.stripe(key).write();
        let mut slot = stripe.remove(&key);
        let result = f(&mut slot);
        if let Some(value) = slot {
            stripe.insert(key, value);
        }
        result
    }

    /// Returns the value for `key`, inserting `make()` first if absent, and
    /// runs `f` on it.
    pub fn get_or_insert_with<R>(
        &self,
        key: i64,
        make: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut stripe = self.stripe(key).write();
        f(stripe.entry(key).or_insert_with(make))
    }

    /// Keeps only entries for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(i64, &mut V) -> bool) {
        for stripe in &self.stripes {
            stripe.write().retain(|key, value| keep(*key, value));
        }
    }

    /// Visits every entry, one stripe at a time.
    pub fn for_each(&self, mut f: impl FnMut(i64, &V)) {
        for stripe in &self.stripes {
            for (key, value) in stripe.read().iter() {
                f(*key, value);
            }
        }
    }

    /// Collects every key, one stripe at a time.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        let mut keys = Vec::with_capacity(self.len());
        for stripe in &self.stripes {
            keys.extend(stripe.read().keys().copied());
        }
        keys
    }

    /// Number of entries (summed stripe by stripe).
    #[must_use]
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|stripe| stripe.read().len()).sum()
    }

    /// Returns true if no stripe holds an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripes.iter().all(|stripe| stripe.read().is_empty())
    }

    /// Removes every entry.
    pub fn clear(&self) {
        for stripe in &self.stripes {
            stripe.write().clear();
        }
    }
}

impl<V: Clone> ShardedLongMap<V> {
    /// Returns a clone of the value.
    #[must_use]
    pub fn get(&self, key: i64) -> Option<V> {
        self.stripe(key).read().get(&key).cloned()
    }

    /// Clones every entry, one stripe at a time.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(i64, V)> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|key, value| out.push((key, value.clone())));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::{collections::BTreeMap, sync::Arc, thread};

    fn key(x: i32, z: i32) -> i64 {
        ChunkPos::new(x, z).as_i64()
    }

    #[test]
    fn test_basic_operations() {
        let map = ShardedLongMap::new(8);
        assert!(map.insert(key(1, 2), "a").is_none());
        assert_eq!(map.get(key(1, 2)), Some("a"));
        assert_eq!(map.insert(key(1, 2), "b"), Some("a"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(key(1, 2)), Some("b"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_compute_inserts_and_removes() {
        let map = ShardedLongMap::<u32>::new(4);
        map.compute(key(0, 0), |slot| *slot = Some(3));
        assert_eq!(map.get(key(0, 0)), Some(3));
        let old = map.compute(key(0, 0), Option::take);
        assert_eq!(old, Some(3));
        assert!(!map.contains_key(key(0, 0)));
    }

    #[test]
    fn test_stripe_count_rounds_up() {
        let map = ShardedLongMap::<u8>::new(5);
        assert_eq!(map.stripes.len(), 8);
        let map = ShardedLongMap::<u8>::new(0);
        assert_eq!(map.stripes.len(), 1);
    }

    #[test]
    fn test_concurrent_disjoint_updates() {
        let map = Arc::new(ShardedLongMap::<u64>::new(16));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..200 {
                        map.get_or_insert_with(key(i, t), || 0, |v| *v += 1);
                        map.get_or_insert_with(key(i, -1), || 0, |v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().expect("worker panicked");
        }
        assert_eq!(map.len(), 200 * 9);
        for i in 0..200 {
            assert_eq!(map.get(key(i, -1)), Some(8));
        }
    }

    #[test]
    fn test_retain_and_snapshot() {
        let map = ShardedLongMap::new(4);
        for i in 0..100 {
            map.insert(key(i, i * 40), i);
        }
        map.retain(|_, value| *value % 2 == 0);
        let mut values: Vec<_> = map.snapshot().into_iter().map(|(_, v)| v).collect();
        values.sort_unstable();
        assert_eq!(values, (0..100).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn test_matches_btree_model() {
        let map = ShardedLongMap::with_shift(2, 8);
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5000 {
            let k = key(rng.random_range(-50..50), rng.random_range(-50..50));
            match rng.random_range(0..3) {
                0 => {
                    let value: u32 = rng.random();
                    assert_eq!(map.insert(k, value), model.insert(k, value));
                }
                1 => assert_eq!(map.remove(k), model.remove(&k)),
                _ => assert_eq!(
                    map.update(k, |v| {
                        *v = v.wrapping_add(1);
                        *v
                    }),
                    model.get_mut(&k).map(|v| {
                        *v = v.wrapping_add(1);
                        *v
                    })
                ),
            }
        }
        let mut keys = map.keys();
        keys.sort_unstable();
        assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
        assert_eq!(map.len(), model.len());
    }
}
