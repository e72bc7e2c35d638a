//! Tickets, levels, holders and the generation pipeline.

pub mod chunk_artifact;
pub mod chunk_generator;
pub mod chunk_holder;
pub mod chunk_holder_manager;
pub mod chunk_level;
pub mod chunk_status;
pub mod chunk_task_scheduler;
pub mod flat_chunk_generator;
pub mod level_propagator;
pub mod ticket;
pub mod ticket_manager;
