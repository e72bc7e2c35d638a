//! Chunk persistence: storage backends and the region I/O pool.

pub mod ram_only;
pub mod region_io;
pub mod region_storage;
pub mod storage;
