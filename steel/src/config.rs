//! Server configuration, read from `steel_config.json5`.

use std::{fs, path::Path};

use anyhow::{Context, bail};
use serde::Deserialize;
use steel_core::config::ChunkSystemConfig;

const DEFAULT_CONFIG: &str = include_str!("../../package-content/steel_config.json5");

/// Top level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SteelConfig {
    /// Directory the world is stored in.
    pub world_dir: String,
    /// Keep chunks in memory only.
    pub ram_only: bool,
    /// Radius around spawn generated to full before startup completes.
    pub spawn_radius: u8,
    /// Milliseconds between chunk system ticks.
    pub tick_millis: u64,
    /// File the chunk system state is dumped to on shutdown, empty to disable.
    pub debug_dump: String,
    /// Chunk system tunables.
    pub chunk_system: ChunkSystemConfig,
}

impl Default for SteelConfig {
    fn default() -> Self {
        Self {
            world_dir: "world".to_string(),
            ram_only: false,
            spawn_radius: 3,
            tick_millis: 50,
            debug_dump: String::new(),
            chunk_system: ChunkSystemConfig::default(),
        }
    }
}

impl SteelConfig {
    /// Reads the config at `path`, writing the default one first if it is missing.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let config_str = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::parse(&config_str).with_context(|| format!("parsing {}", path.display()))?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, DEFAULT_CONFIG)
                .with_context(|| format!("writing {}", path.display()))?;
            log::info!("Wrote default config to {}", path.display());
            Self::parse(DEFAULT_CONFIG)?
        };
        Ok(config)
    }

    fn parse(config_str: &str) -> anyhow::Result<Self> {
        let config: SteelConfig = serde_json5::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field is within its supported range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.spawn_radius > 32 {
            bail!("spawn_radius must be in range 0..=32");
        }
        if !(1..=1000).contains(&self.tick_millis) {
            bail!("tick_millis must be in range 1..=1000");
        }
        if let Err(reason) = self.chunk_system.validate() {
            bail!("invalid chunk_system config: {reason}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_file_matches_defaults() {
        let parsed = SteelConfig::parse(DEFAULT_CONFIG).expect("default config parses");
        let defaults = SteelConfig::default();
        assert_eq!(parsed.world_dir, defaults.world_dir);
        assert_eq!(parsed.spawn_radius, defaults.spawn_radius);
        assert_eq!(parsed.tick_millis, defaults.tick_millis);
        assert_eq!(
            parsed.chunk_system.unload_min_batch,
            defaults.chunk_system.unload_min_batch
        );
    }

    #[test]
    fn test_rejects_bad_chunk_system() {
        let result = SteelConfig::parse("{ chunk_system: { io_threads: 0 } }");
        assert!(result.is_err());
    }
}
