//! Wire messages.
//!
//! A datagram carries one [`Packet`]: a protocol [`Message`] plus the gossip
//! piggybacked on it. A push/pull stream carries bare [`Message`] frames.

use crate::{Member, Node};
use serde::{Deserialize, Serialize};

/// A membership fact being disseminated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Snapshot of the member record
    pub member: Member,
    /// Name of the node asserting the record
    pub origin: String,
}

impl Update {
    /// Create an update
    #[must_use]
    pub fn new(member: Member, origin: impl Into<String>) -> Self {
        Self {
            member,
            origin: origin.into(),
        }
    }
}

/// Protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Direct liveness probe.
    ///
    /// The target name is sent so a node restarted under another name at the
    /// same address does not answer for its predecessor.
    Ping {
        /// Sequence number echoed in the ack
        seq: u32,
        /// Name of the node being probed
        target: String,
    },
    /// Answer to a [`Message::Ping`]
    Ack {
        /// Sequence number of the ping
        seq: u32,
    },
    /// Ask a relay to probe `target` on the sender's behalf
    IndirectPing {
        /// Sequence number echoed in the indirect ack
        seq: u32,
        /// Node to probe
        target: Node,
    },
    /// Relay's report that the target answered
    IndirectAck {
        /// Sequence number of the indirect ping
        seq: u32,
    },
    /// Gossip-only packet sent when there is no probe traffic to ride on
    Gossip,
    /// Full-state exchange over a stream
    PushPull {
        /// Sender identity
        from: Node,
        /// True for the exchange performed while joining
        join: bool,
        /// Sender's complete member table
        members: Vec<Member>,
    },
}

impl Message {
    /// Message kind, for logging and error reporting
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Ack { .. } => "ack",
            Self::IndirectPing { .. } => "indirect-ping",
            Self::IndirectAck { .. } => "indirect-ack",
            Self::Gossip => "gossip",
            Self::PushPull { .. } => "push-pull",
        }
    }
}

/// Unit of datagram transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Protocol message
    pub message: Message,
    /// Piggybacked membership updates
    pub gossip: Vec<Update>,
}

impl Packet {
    /// Create a packet without gossip
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message,
            gossip: Vec::new(),
        }
    }

    /// Attach gossip
    #[must_use]
    pub fn with_gossip(mut self, gossip: Vec<Update>) -> Self {
        self.gossip = gossip;
        self
    }
}
