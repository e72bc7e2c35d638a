//! # Steel Utils
//!
//! Coordinates, lock aliases and the concurrency primitives the chunk system
//! is built on.

pub mod concurrent;
pub mod locks;
mod types;

pub use types::{ChunkPos, REGION_SHIFT};
