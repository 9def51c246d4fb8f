//! CHORUS Cluster
//!
//! Gossip-based cluster membership: SWIM-style failure detection with
//! indirect probes and corroborated suspicion, piggybacked dissemination,
//! and periodic push/pull anti-entropy.
//!
//! Each node is one [`Membership`] over a [`Transport`]. All protocol state
//! lives in a per-node [`engine::Engine`] behind one lock; background tasks
//! never hold it across I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
mod gossip;
pub mod membership;
pub mod net;
pub mod probe;
pub mod scheduler;
pub mod state;
pub mod suspicion;
mod sync;
pub mod transport;

pub use broadcast::{BroadcastQueue, retransmit_limit};
pub use config::{Config, ConfigError, MIN_PACKET_BUDGET};
pub use error::{ClusterError, ClusterResult};
pub use events::{EventBus, EventSinks, MemberEvent, MemberEventKind};
pub use membership::Membership;
pub use net::{NetStream, NetTransport, create, join};
pub use probe::ProbeRing;
pub use scheduler::Scheduler;
pub use state::{MemberTable, MergeOutcome, Tombstone};
pub use suspicion::{LogScaledTimeout, Suspicion, SuspicionTable, SuspicionTimeout};
pub use transport::{StreamConn, Transport, TransportError, TransportResult};

pub use chorus_core::{Incarnation, Member, MemberStatus, Node};
