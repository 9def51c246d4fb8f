//! Incarnation numbers.
//!
//! An incarnation is a logical clock owned by exactly one node. Only that node
//! advances it; every other node merely observes it. It orders conflicting
//! claims about the node's status.

use serde::{Deserialize, Serialize};

/// Per-node monotonic counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Incarnation(u64);

impl Incarnation {
    /// The first incarnation of a node
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The incarnation directly after this one
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Advance past both `self` and `claimed`.
    ///
    /// Used when refuting: the result is strictly greater than anything the
    /// cluster has asserted about us so far.
    #[must_use]
    pub fn refute(&self, claimed: Incarnation) -> Self {
        (*self).max(claimed).next()
    }
}

impl Default for Incarnation {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for Incarnation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inc{}", self.0)
    }
}

impl From<u64> for Incarnation {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incarnation_next() {
        let i = Incarnation::zero();
        assert_eq!(i.as_u64(), 0);
        assert_eq!(i.next().as_u64(), 1);
        assert_eq!(i.as_u64(), 0);
    }

    #[test]
    fn test_incarnation_refute_exceeds_both() {
        let own = Incarnation::from_raw(3);
        assert_eq!(own.refute(Incarnation::from_raw(7)).as_u64(), 8);
        assert_eq!(own.refute(Incarnation::from_raw(1)).as_u64(), 4);
        assert_eq!(own.refute(own).as_u64(), 4);
    }

    #[test]
    fn test_incarnation_saturates() {
        let max = Incarnation::from_raw(u64::MAX);
        assert_eq!(max.next(), max);
    }

    #[test]
    fn test_incarnation_display() {
        assert_eq!(Incarnation::from(12).to_string(), "inc12");
    }
}
