//! Cluster harness.
//!
//! [`SimCluster`] starts real [`Membership`] nodes over one [`SimNetwork`]
//! and drives partitions, crashes, and departures against them. Drive it
//! from a paused tokio clock (`#[tokio::test(start_paused = true)]`) and
//! protocol timers advance instantly.

use crate::network::{NetworkCondition, SimNetwork};
use crate::node::{Receivers, SimNode, SimNodeState};
use crate::seed::SimSeed;
use chorus_cluster::{ClusterError, Config, Membership};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// How often convergence checks poll the nodes
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Harness errors
#[derive(Debug, Error)]
pub enum SimError {
    /// A node failed to start or act
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// No node at this index
    #[error("no node at index {0}")]
    NoSuchNode(usize),

    /// Nodes did not agree on membership in time
    #[error("cluster did not converge within {0:?}")]
    NotConverged(Duration),

    /// The network has no addresses left to hand out
    #[error("simulated network is out of addresses")]
    AddressesExhausted,
}

/// Adjusts each node's configuration before it starts
pub type Tuning = Arc<dyn Fn(Config) -> Config + Send + Sync>;

/// Harness configuration
#[derive(Clone)]
pub struct SimConfig {
    /// Base seed for the network and every node
    pub seed: SimSeed,
    /// Link quality
    pub condition: NetworkCondition,
    /// Capacity of each node's event channels
    pub event_capacity: usize,
    tuning: Option<Tuning>,
}

impl std::fmt::Debug for SimConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimConfig")
            .field("seed", &self.seed)
            .field("condition", &self.condition)
            .field("event_capacity", &self.event_capacity)
            .field("tuned", &self.tuning.is_some())
            .finish()
    }
}

impl SimConfig {
    /// Create a config with a perfect network
    #[must_use]
    pub fn new(seed: SimSeed) -> Self {
        Self {
            seed,
            condition: NetworkCondition::perfect(),
            event_capacity: 256,
            tuning: None,
        }
    }

    /// Set link quality
    #[must_use]
    pub fn with_condition(mut self, condition: NetworkCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Set event channel capacity
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Adjust every node's [`Config`] before it starts
    #[must_use]
    pub fn with_tuning(mut self, tuning: impl Fn(Config) -> Config + Send + Sync + 'static) -> Self {
        self.tuning = Some(Arc::new(tuning));
        self
    }

    /// Configuration for the node called `name`
    #[must_use]
    pub fn node_config(&self, name: &str) -> Config {
        let config = Config::local(name).with_seed(self.seed.derive(name).seed);
        match &self.tuning {
            Some(tune) => tune(config),
            None => config,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(SimSeed::default())
    }
}

/// A whole cluster on one simulated network
#[derive(Debug)]
pub struct SimCluster {
    config: SimConfig,
    network: SimNetwork,
    nodes: Vec<SimNode>,
}

impl SimCluster {
    /// Create an empty cluster
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let network = SimNetwork::new(&config.seed);
        network.set_condition(config.condition.clone());
        Self {
            config,
            network,
            nodes: Vec::new(),
        }
    }

    /// Start `n` nodes named `node-0` .. `node-{n-1}`, one after another
    ///
    /// # Errors
    ///
    /// Returns error if any node fails to start
    pub async fn with_nodes(config: SimConfig, n: usize) -> Result<Self, SimError> {
        let mut cluster = Self::new(config);
        for i in 0..n {
            cluster.spawn(format!("node-{i}")).await?;
        }
        Ok(cluster)
    }

    /// Start a node. The first node creates the cluster; later nodes join
    /// through the running ones, most recently started first. Returns the
    /// node's index.
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot create or join the cluster
    pub async fn spawn(&mut self, name: impl Into<String>) -> Result<usize, SimError> {
        let name = name.into();
        let transport = self.network.transport().ok_or(SimError::AddressesExhausted)?;
        let (sinks, receivers) = Receivers::channel(self.config.event_capacity);
        let config = self.config.node_config(&name).with_events(sinks);

        let mut seeds = self.running_addrs();
        seeds.reverse();
        let membership = if seeds.is_empty() {
            Membership::create(config, transport).await?
        } else {
            Membership::join(config, transport, &seeds).await?
        };
        info!(node = %membership.local_node(), seeds = seeds.len(), "sim node started");

        self.nodes.push(SimNode::new(name, membership, receivers));
        Ok(self.nodes.len() - 1)
    }

    /// The network the nodes share
    #[must_use]
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Node at `index`
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    /// Node at `index`, mutably
    pub fn node_mut(&mut self, index: usize) -> Option<&mut SimNode> {
        self.nodes.get_mut(index)
    }

    /// All nodes in start order
    #[must_use]
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Number of nodes ever started
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if no node was started
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn running_addrs(&self) -> Vec<SocketAddr> {
        self.nodes
            .iter()
            .filter(|n| n.is_running())
            .map(SimNode::addr)
            .collect()
    }

    fn addr(&self, index: usize) -> Result<SocketAddr, SimError> {
        self.node(index)
            .map(SimNode::addr)
            .ok_or(SimError::NoSuchNode(index))
    }

    /// Check if every running node sees exactly the running nodes as live
    #[must_use]
    pub fn is_converged(&self) -> bool {
        let expected: BTreeSet<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_running())
            .map(|n| n.name().to_string())
            .collect();
        self.nodes
            .iter()
            .filter(|n| n.is_running())
            .all(|n| n.live_names().into_iter().collect::<BTreeSet<_>>() == expected)
    }

    /// Poll until `check` holds or `timeout` passes. Returns whether it held.
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let poll = async {
            while !check(self) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Wait until every running node agrees on the live set
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NotConverged`] on timeout
    pub async fn await_convergence(&self, timeout: Duration) -> Result<(), SimError> {
        if self.wait_until(timeout, Self::is_converged).await {
            Ok(())
        } else {
            Err(SimError::NotConverged(timeout))
        }
    }

    /// Split nodes into groups by index; traffic only flows within a group
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NoSuchNode`] for an unknown index
    pub fn partition(&self, groups: &[&[usize]]) -> Result<(), SimError> {
        let groups = groups
            .iter()
            .map(|group| group.iter().map(|&i| self.addr(i)).collect())
            .collect::<Result<Vec<Vec<_>>, _>>()?;
        info!(groups = groups.len(), "partitioning network");
        self.network.partition(groups);
        Ok(())
    }

    /// Remove all partitions
    pub fn heal(&self) {
        info!("healing network");
        self.network.heal();
    }

    /// Silence a node without stopping it
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NoSuchNode`] for an unknown index
    pub fn crash(&mut self, index: usize) -> Result<(), SimError> {
        let addr = self.addr(index)?;
        self.network.crash(addr);
        if let Some(node) = self.nodes.get_mut(index) {
            node.set_state(SimNodeState::Crashed);
            info!(node = node.name(), "crashed");
        }
        Ok(())
    }

    /// Let a crashed node talk again
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NoSuchNode`] for an unknown index
    pub fn restore(&mut self, index: usize) -> Result<(), SimError> {
        let addr = self.addr(index)?;
        self.network.restore(addr);
        if let Some(node) = self.nodes.get_mut(index) {
            node.set_state(SimNodeState::Running);
        }
        Ok(())
    }

    /// Make a node leave gracefully
    ///
    /// # Errors
    ///
    /// Returns error for an unknown index or if the node already stopped
    pub async fn leave(&mut self, index: usize, timeout: Duration) -> Result<(), SimError> {
        let node = self.nodes.get_mut(index).ok_or(SimError::NoSuchNode(index))?;
        node.membership().leave(timeout).await?;
        node.set_state(SimNodeState::Stopped);
        Ok(())
    }

    /// Shut every node down
    pub async fn shutdown_all(&mut self) {
        for node in &mut self.nodes {
            node.membership().shutdown().await;
            node.set_state(SimNodeState::Stopped);
        }
    }
}
