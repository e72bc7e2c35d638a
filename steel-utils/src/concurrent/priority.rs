use serde::{Deserialize, Serialize};

/// Scheduling priority of a task.
///
/// Variants are declared from most to least urgent, so the derived `Ord`
/// sorts urgent tasks first: `Priority::Blocking < Priority::Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Something is blocked waiting on this task.
    Blocking,
    /// Highest non-blocking priority.
    Highest,
    /// Higher than high.
    Higher,
    /// High priority.
    High,
    /// Default priority.
    Normal,
    /// Low priority.
    Low,
    /// Lower than low.
    Lower,
    /// Lowest priority that still makes progress when the pool is busy.
    Lowest,
    /// Background work.
    Idle,
}

impl Priority {
    /// Every priority, most urgent first.
    pub const ALL: [Priority; 9] = [
        Priority::Blocking,
        Priority::Highest,
        Priority::Higher,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lower,
        Priority::Lowest,
        Priority::Idle,
    ];

    /// Returns true if `self` is strictly more urgent than `other`.
    #[must_use]
    pub fn is_higher_than(self, other: Priority) -> bool {
        self < other
    }

    /// Returns true if `self` is at least as urgent as `other`.
    #[must_use]
    pub fn is_higher_or_equal(self, other: Priority) -> bool {
        self <= other
    }

    /// Returns true if `self` is strictly less urgent than `other`.
    #[must_use]
    pub fn is_lower_than(self, other: Priority) -> bool {
        self > other
    }

    /// The more urgent of the two.
    #[must_use]
    pub fn highest_of(self, other: Priority) -> Priority {
        Ord::min(self, other)
    }

    /// The less urgent of the two.
    #[must_use]
    pub fn lowest_of(self, other: Priority) -> Priority {
        Ord::max(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_urgent_first() {
        let mut sorted = Priority::ALL;
        sorted.reverse();
        sorted.sort();
        assert_eq!(sorted, Priority::ALL);
        assert!(Priority::Blocking.is_higher_than(Priority::Normal));
        assert!(Priority::Idle.is_lower_than(Priority::Lowest));
    }

    #[test]
    fn test_highest_and_lowest_of() {
        assert_eq!(Priority::Low.highest_of(Priority::High), Priority::High);
        assert_eq!(Priority::Low.lowest_of(Priority::High), Priority::Low);
    }
}
