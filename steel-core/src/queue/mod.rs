//! Queues shared between the tick thread and the rest of the chunk system.

pub mod unload_queue;
