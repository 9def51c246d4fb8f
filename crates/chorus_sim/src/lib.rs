//! CHORUS Simulation
//!
//! An in-memory network with loss, latency, partitions, and crashes, and a
//! harness that runs whole clusters over it. Every run is reproducible
//! from a seed when driven by a paused tokio clock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod harness;
pub mod network;
pub mod node;
pub mod seed;

pub use harness::{SimCluster, SimConfig, SimError};
pub use network::{
    MAX_HOSTS, NetworkCondition, NetworkStats, SIM_PORT, SimNetwork, SimStream, SimTransport,
};
pub use node::{EventLog, SimNode, SimNodeState};
pub use seed::{SeedSource, SimSeed};
