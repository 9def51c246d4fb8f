//! Node configuration.
//!
//! The presets follow the conventional memberlist tuning: `lan` errs on the
//! side of fast convergence, `wan` tolerates slower links, `local` is tuned
//! for loopback clusters and tests.

use crate::events::EventSinks;
use crate::suspicion::{LogScaledTimeout, SuspicionTimeout};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Smallest datagram budget that still fits a probe plus a few updates
pub const MIN_PACKET_BUDGET: usize = 256;

/// Configuration errors, reported by `create`/`join` before anything starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Node name is empty
    #[error("Node name must not be empty")]
    EmptyName,

    /// A duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// A multiplier or count that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    /// Datagram budget too small
    #[error("Packet budget {0} is below the minimum of {MIN_PACKET_BUDGET} bytes")]
    PacketBudgetTooSmall(usize),

    /// Advertised address cannot be reached by peers
    #[error("Cannot advertise unspecified address {0}; set advertise_addr")]
    UnspecifiedAdvertiseAddr(SocketAddr),

    /// Config file could not be read or parsed
    #[error("Invalid config file: {0}")]
    File(String),
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster-unique node name
    pub name: String,
    /// Address the transport binds to
    pub bind_addr: SocketAddr,
    /// Address gossiped to peers, if different from the bound one
    pub advertise_addr: Option<SocketAddr>,
    /// Opaque application metadata attached to the local member
    pub meta: Vec<u8>,

    /// Round-trip estimate; the direct-probe ack wait. Should be set to the
    /// 99th percentile RTT of the network.
    #[serde(with = "duration_ms")]
    pub rtt: Duration,

    /// Interval between probe rounds. Lower detects failures faster at the
    /// cost of bandwidth.
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,

    /// Interval between gossip-only rounds for updates that could not ride
    /// on probe traffic. Zero disables them.
    #[serde(with = "duration_ms")]
    pub gossip_interval: Duration,

    /// Random peers contacted per gossip round
    pub gossip_nodes: usize,

    /// Interval between full-state push/pull exchanges. Zero disables them.
    #[serde(with = "duration_ms")]
    pub push_pull_interval: Duration,

    /// Deadline for a whole push/pull exchange, connect included
    #[serde(with = "duration_ms")]
    pub stream_timeout: Duration,

    /// Relays asked to probe a target that missed a direct probe (k)
    pub indirect_checks: usize,

    /// Scales the minimum suspicion timeout:
    ///
    ///   min = suspicion_mult * max(1, log10(N)) * probe_interval
    pub suspicion_mult: u32,

    /// Upper bound of the suspicion timeout, as a multiple of its minimum
    pub suspicion_max_timeout_mult: u32,

    /// Scales how often an update is piggybacked:
    ///
    ///   retransmits = retransmit_mult * ceil(log10(N + 1))
    pub retransmit_mult: u32,

    /// Maximum encoded datagram size, in bytes
    pub packet_budget: usize,

    /// Maximum queued updates; the oldest low-priority ones go first
    pub broadcast_capacity: usize,

    /// How long Dead/Left records are kept (and still gossiped to) before
    /// being reaped
    #[serde(with = "duration_ms")]
    pub tombstone_ttl: Duration,

    /// Interval of the tombstone reaper
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,

    /// Seed for peer selection and shuffles; `None` draws from entropy
    pub seed: Option<u64>,

    /// Suspicion deadline policy; `None` uses [`LogScaledTimeout`]
    #[serde(skip)]
    pub suspicion_timeout: Option<Arc<dyn SuspicionTimeout>>,

    /// Application notification channels
    #[serde(skip)]
    pub events: EventSinks,
}

impl Config {
    /// Defaults for a local area network
    #[must_use]
    pub fn lan(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            advertise_addr: None,
            meta: Vec::new(),
            rtt: Duration::from_millis(500),
            probe_interval: Duration::from_secs(1),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(10),
            indirect_checks: 3,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            retransmit_mult: 4,
            packet_budget: 1400,
            broadcast_capacity: 1024,
            tombstone_ttl: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
            seed: None,
            suspicion_timeout: None,
            events: EventSinks::default(),
        }
    }

    /// Like [`Config::lan`], tuned for wide area links
    #[must_use]
    pub fn wan(name: impl Into<String>) -> Self {
        let mut config = Self::lan(name);
        config.rtt = Duration::from_secs(3);
        config.probe_interval = Duration::from_secs(5);
        config.gossip_interval = Duration::from_millis(500);
        config.gossip_nodes = 4;
        config.push_pull_interval = Duration::from_secs(60);
        config.stream_timeout = Duration::from_secs(30);
        config.suspicion_mult = 6;
        config.tombstone_ttl = Duration::from_secs(60);
        config.reap_interval = Duration::from_secs(20);
        config
    }

    /// Like [`Config::lan`], tuned for loopback
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        let mut config = Self::lan(name);
        config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 7946));
        config.rtt = Duration::from_millis(200);
        config.gossip_interval = Duration::from_millis(100);
        config.push_pull_interval = Duration::from_secs(15);
        config.stream_timeout = Duration::from_secs(1);
        config.indirect_checks = 1;
        config.retransmit_mult = 2;
        config.suspicion_mult = 3;
        config.tombstone_ttl = Duration::from_secs(15);
        config.reap_interval = Duration::from_secs(5);
        config
    }

    /// Load a JSON config file; missing fields keep their `lan` defaults
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::File`] if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::File(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::File(e.to_string()))
    }

    /// Set bind address
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set advertise address
    #[must_use]
    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    /// Set metadata
    #[must_use]
    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    /// Set round-trip estimate
    #[must_use]
    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }

    /// Set probe interval
    #[must_use]
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set gossip interval
    #[must_use]
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set push/pull interval
    #[must_use]
    pub fn with_push_pull_interval(mut self, interval: Duration) -> Self {
        self.push_pull_interval = interval;
        self
    }

    /// Set indirect probe fan-out
    #[must_use]
    pub fn with_indirect_checks(mut self, k: usize) -> Self {
        self.indirect_checks = k;
        self
    }

    /// Set suspicion multiplier
    #[must_use]
    pub fn with_suspicion_mult(mut self, mult: u32) -> Self {
        self.suspicion_mult = mult;
        self
    }

    /// Set retransmit multiplier
    #[must_use]
    pub fn with_retransmit_mult(mut self, mult: u32) -> Self {
        self.retransmit_mult = mult;
        self
    }

    /// Set tombstone retention
    #[must_use]
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Set RNG seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set suspicion deadline policy
    #[must_use]
    pub fn with_suspicion_timeout(mut self, policy: Arc<dyn SuspicionTimeout>) -> Self {
        self.suspicion_timeout = Some(policy);
        self
    }

    /// Set notification channels
    #[must_use]
    pub fn with_events(mut self, events: EventSinks) -> Self {
        self.events = events;
        self
    }

    /// Direct probe ack wait
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        self.rtt.min(self.probe_interval)
    }

    /// Resolved suspicion policy
    #[must_use]
    pub fn suspicion_policy(&self) -> Arc<dyn SuspicionTimeout> {
        match &self.suspicion_timeout {
            Some(policy) => Arc::clone(policy),
            None => Arc::new(LogScaledTimeout::from_config(self)),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        for (field, value) in [
            ("rtt", self.rtt),
            ("probe_interval", self.probe_interval),
            ("stream_timeout", self.stream_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(field));
            }
        }
        if self.suspicion_mult == 0 {
            return Err(ConfigError::ZeroValue("suspicion_mult"));
        }
        if self.suspicion_max_timeout_mult == 0 {
            return Err(ConfigError::ZeroValue("suspicion_max_timeout_mult"));
        }
        if self.retransmit_mult == 0 {
            return Err(ConfigError::ZeroValue("retransmit_mult"));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::ZeroValue("broadcast_capacity"));
        }
        if !self.gossip_interval.is_zero() && self.gossip_nodes == 0 {
            return Err(ConfigError::ZeroValue("gossip_nodes"));
        }
        if self.packet_budget < MIN_PACKET_BUDGET {
            return Err(ConfigError::PacketBudgetTooSmall(self.packet_budget));
        }
        match self.advertise_addr {
            Some(addr) if addr.ip().is_unspecified() => {
                return Err(ConfigError::UnspecifiedAdvertiseAddr(addr));
            }
            None if self.bind_addr.ip().is_unspecified() => {
                return Err(ConfigError::UnspecifiedAdvertiseAddr(self.bind_addr));
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::lan(String::new())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
