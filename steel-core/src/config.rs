//! Tunables of the chunk system.

use std::{num::NonZeroUsize, thread};

use serde::{Deserialize, Serialize};

use crate::chunk::chunk_level::ChunkLevel;

/// Chunk system configuration.
///
/// Passed by value to [`crate::ChunkSystem::new`]; nothing reads it from a
/// global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSystemConfig {
    /// Generation/decode worker threads, 0 picks half the available cores.
    pub worker_threads: usize,
    /// Region I/O threads.
    pub io_threads: usize,
    /// Chunk coordinates are shifted by this to get their region shard.
    pub region_shift: u32,
    /// Lock stripes of the holder and ticket maps.
    pub map_stripes: usize,
    /// Level added per step of Chebyshev distance during propagation.
    pub propagation_step_cost: u8,
    /// Stage tasks started per tick at most; the rest wait for the next tick.
    pub max_stage_tasks_per_tick: usize,
    /// Minimum number of chunks unloaded per tick when any are queued.
    pub unload_min_batch: usize,
    /// Fraction of the queued chunks unloaded per tick.
    pub unload_fraction: f64,
    /// Ticks a modified chunk may stay unsaved before autosave picks it up.
    pub autosave_interval_ticks: u64,
    /// Chunks written by autosave per tick at most.
    pub autosave_max_per_tick: usize,
    /// Zstd level used by the region file backend.
    pub compression_level: i32,
}

impl Default for ChunkSystemConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            io_threads: 2,
            region_shift: steel_utils::REGION_SHIFT,
            map_stripes: 64,
            propagation_step_cost: 1,
            max_stage_tasks_per_tick: 512,
            unload_min_batch: 50,
            unload_fraction: 0.05,
            autosave_interval_ticks: 6000,
            autosave_max_per_tick: 24,
            compression_level: 3,
        }
    }
}

impl ChunkSystemConfig {
    /// Checks every field is within its supported range.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.io_threads == 0 {
            return Err("io_threads must be at least 1");
        }
        if self.region_shift > 10 {
            return Err("region_shift must be in range 0..=10");
        }
        if self.map_stripes == 0 || self.map_stripes > 4096 {
            return Err("map_stripes must be in range 1..=4096");
        }
        if self.propagation_step_cost == 0 || self.propagation_step_cost >= ChunkLevel::MAX_LEVEL {
            return Err("propagation_step_cost must be at least 1 and below the maximum ticket level");
        }
        if self.max_stage_tasks_per_tick == 0 {
            return Err("max_stage_tasks_per_tick must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.unload_fraction) {
            return Err("unload_fraction must be in range 0..=1");
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err("compression_level must be in range 1..=22");
        }
        Ok(())
    }

    /// Worker thread count with `0` resolved against the machine.
    #[must_use]
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        let cores = thread::available_parallelism().map_or(2, NonZeroUsize::get);
        (cores / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ChunkSystemConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_step_cost() {
        let config = ChunkSystemConfig {
            propagation_step_cost: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ChunkSystemConfig =
            serde_json::from_str(r#"{ "io_threads": 4 }"#).expect("valid config");
        assert_eq!(config.io_threads, 4);
        assert_eq!(config.unload_min_batch, 50);
        assert!(config.resolved_worker_threads() >= 1);
    }
}
