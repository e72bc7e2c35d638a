use steel_utils::concurrent::Priority;

use crate::chunk::chunk_status::ChunkStatus;

/// Utilities for converting between chunk levels and statuses.
pub struct ChunkLevel;

impl ChunkLevel {
    /// Ticket levels at or below this threshold require a full chunk.
    pub const FULL_STATUS_LEVEL: u8 = 33;
    /// Levels at or below this get the most urgent background work.
    pub const HIGH_PRIORITY_LEVEL: u8 = 31;
    /// Highest level; a chunk at this level is not required at all.
    pub const MAX_LEVEL: u8 = Self::FULL_STATUS_LEVEL + ChunkStatus::Full.id() + 1;

    /// Returns the generation status for the given level.
    ///
    /// Every level above [`ChunkLevel::FULL_STATUS_LEVEL`] requires one stage less.
    #[must_use]
    pub fn generation_status(level: u8) -> Option<ChunkStatus> {
        if level >= Self::MAX_LEVEL {
            None
        } else if level <= Self::FULL_STATUS_LEVEL {
            Some(ChunkStatus::Full)
        } else {
            let distance = level - Self::FULL_STATUS_LEVEL;
            ChunkStatus::from_id(ChunkStatus::Full.id() - distance)
        }
    }

    /// Highest level that still requires `status`.
    #[must_use]
    pub fn by_status(status: ChunkStatus) -> u8 {
        Self::FULL_STATUS_LEVEL + (ChunkStatus::Full.id() - status.id())
    }

    /// Scheduling priority of work for a chunk at `level`.
    #[must_use]
    pub fn priority(level: u8, has_waiters: bool) -> Priority {
        if has_waiters {
            return Priority::Higher;
        }
        match level {
            l if l <= Self::HIGH_PRIORITY_LEVEL => Priority::High,
            l if l <= Self::FULL_STATUS_LEVEL => Priority::Normal,
            l if l <= Self::by_status(ChunkStatus::Features) => Priority::Low,
            _ => Priority::Lower,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_to_status() {
        assert_eq!(ChunkLevel::MAX_LEVEL, 45);
        assert_eq!(ChunkLevel::generation_status(0), Some(ChunkStatus::Full));
        assert_eq!(ChunkLevel::generation_status(33), Some(ChunkStatus::Full));
        assert_eq!(ChunkLevel::generation_status(34), Some(ChunkStatus::Spawn));
        assert_eq!(ChunkLevel::generation_status(44), Some(ChunkStatus::Empty));
        assert_eq!(ChunkLevel::generation_status(45), None);
    }

    #[test]
    fn test_by_status_inverts_generation_status() {
        for status in ChunkStatus::ALL {
            assert_eq!(
                ChunkLevel::generation_status(ChunkLevel::by_status(status)),
                Some(status)
            );
        }
    }

    #[test]
    fn test_priority_by_level() {
        assert_eq!(ChunkLevel::priority(40, true), Priority::Higher);
        assert_eq!(ChunkLevel::priority(31, false), Priority::High);
        assert_eq!(ChunkLevel::priority(33, false), Priority::Normal);
        let features = ChunkLevel::by_status(ChunkStatus::Features);
        assert_eq!(ChunkLevel::priority(features, false), Priority::Low);
        assert_eq!(ChunkLevel::priority(44, false), Priority::Lower);
    }
}
