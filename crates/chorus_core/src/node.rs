//! Node identity.
//!
//! A node is identified by a cluster-unique name plus the address peers use
//! to reach it. Identity is immutable once created.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Identity of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    name: String,
    addr: SocketAddr,
}

impl Node {
    /// Create a node identity
    #[must_use]
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }

    /// Cluster-unique name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reachable address
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_accessors() {
        let addr: SocketAddr = "127.0.0.1:7946".parse().unwrap();
        let node = Node::new("alpha", addr);
        assert_eq!(node.name(), "alpha");
        assert_eq!(node.addr(), addr);
    }

    #[test]
    fn test_node_display() {
        let node = Node::new("alpha", "10.0.0.1:7946".parse().unwrap());
        assert_eq!(format!("{}", node), "alpha@10.0.0.1:7946");
    }

    #[test]
    fn test_node_ord() {
        let addr: SocketAddr = "10.0.0.1:7946".parse().unwrap();
        let a = Node::new("a", addr);
        let b = Node::new("b", addr);
        assert!(a < b);
    }
}
