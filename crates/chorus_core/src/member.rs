//! Member records and the precedence order between them.

use crate::{Incarnation, Node};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::net::SocketAddr;

/// Believed status of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Responding to probes
    Alive,
    /// Missed a probe; may still refute
    Suspect,
    /// Declared failed
    Dead,
    /// Departed voluntarily
    Left,
}

impl MemberStatus {
    /// Rank used to break ties at equal incarnation.
    ///
    /// Bad news wins: Dead and Left outrank Suspect, which outranks Alive.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Alive => 0,
            Self::Suspect => 1,
            Self::Dead | Self::Left => 2,
        }
    }

    /// Alive or Suspect
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Alive | Self::Suspect)
    }

    /// Short lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Suspect => "suspect",
            Self::Dead => "dead",
            Self::Left => "left",
        }
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member record as known by one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Cluster-unique name
    pub name: String,
    /// Reachable address
    pub addr: SocketAddr,
    /// Opaque application metadata
    pub meta: Vec<u8>,
    /// Believed status
    pub status: MemberStatus,
    /// Incarnation the status refers to
    pub incarnation: Incarnation,
}

impl Member {
    /// Create an Alive member at incarnation zero
    #[must_use]
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            meta: Vec::new(),
            status: MemberStatus::Alive,
            incarnation: Incarnation::zero(),
        }
    }

    /// Set status
    #[must_use]
    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// Set incarnation
    #[must_use]
    pub fn with_incarnation(mut self, incarnation: impl Into<Incarnation>) -> Self {
        self.incarnation = incarnation.into();
        self
    }

    /// Set metadata
    #[must_use]
    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    /// Identity of this member
    #[must_use]
    pub fn node(&self) -> Node {
        Node::new(self.name.clone(), self.addr)
    }

    /// Check if member is Alive or Suspect
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Compare two claims about the same node.
    ///
    /// Higher incarnation wins; at equal incarnation the higher
    /// [`MemberStatus::rank`] wins. `Equal` means neither claim supersedes
    /// the other.
    #[must_use]
    pub fn precedence(&self, other: &Member) -> Ordering {
        self.incarnation
            .cmp(&other.incarnation)
            .then(self.status.rank().cmp(&other.status.rank()))
    }

    /// Check if this claim replaces `other`
    #[must_use]
    pub fn supersedes(&self, other: &Member) -> bool {
        self.precedence(other) == Ordering::Greater
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} ({}, {})",
            self.name, self.addr, self.status, self.incarnation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(status: MemberStatus, inc: u64) -> Member {
        Member::new("n1", "10.0.0.1:7946".parse().unwrap())
            .with_status(status)
            .with_incarnation(inc)
    }

    #[test]
    fn test_member_new() {
        let m = Member::new("n1", "10.0.0.1:7946".parse().unwrap());
        assert_eq!(m.status, MemberStatus::Alive);
        assert_eq!(m.incarnation, Incarnation::zero());
        assert!(m.meta.is_empty());
        assert!(m.is_live());
    }

    #[test]
    fn test_higher_incarnation_wins() {
        let alive = member(MemberStatus::Alive, 5);
        let dead = member(MemberStatus::Dead, 4);
        assert!(alive.supersedes(&dead));
        assert!(!dead.supersedes(&alive));
    }

    #[test]
    fn test_bad_news_wins_at_equal_incarnation() {
        let alive = member(MemberStatus::Alive, 2);
        let suspect = member(MemberStatus::Suspect, 2);
        let dead = member(MemberStatus::Dead, 2);
        let left = member(MemberStatus::Left, 2);

        assert!(suspect.supersedes(&alive));
        assert!(dead.supersedes(&suspect));
        assert!(left.supersedes(&suspect));
        assert!(!alive.supersedes(&suspect));
        assert!(!dead.supersedes(&left));
        assert!(!left.supersedes(&dead));
    }

    #[test]
    fn test_identical_claims_do_not_supersede() {
        let a = member(MemberStatus::Suspect, 3);
        assert!(!a.supersedes(&a.clone()));
        assert_eq!(a.precedence(&a), Ordering::Equal);
    }

    #[test]
    fn test_status_is_live() {
        assert!(MemberStatus::Alive.is_live());
        assert!(MemberStatus::Suspect.is_live());
        assert!(!MemberStatus::Dead.is_live());
        assert!(!MemberStatus::Left.is_live());
    }

    #[test]
    fn test_member_display() {
        let m = member(MemberStatus::Suspect, 7);
        assert_eq!(m.to_string(), "n1@10.0.0.1:7946 (suspect, inc7)");
    }
}
