//! Simulated cluster nodes.

use crate::network::SimTransport;
use chorus_cluster::{EventSinks, Membership};
use chorus_core::Member;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// State of a simulated node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimNodeState {
    /// Node is running
    Running,
    /// Node's traffic is dropped by the network
    Crashed,
    /// Node left or was shut down
    Stopped,
}

/// Membership events a node has delivered so far, by member name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    /// Join events
    pub joined: Vec<String>,
    /// Leave events
    pub left: Vec<String>,
    /// Update events
    pub updated: Vec<String>,
}

/// Receiving ends of a node's event channels
pub(crate) struct Receivers {
    join: mpsc::Receiver<Member>,
    leave: mpsc::Receiver<Member>,
    update: mpsc::Receiver<Member>,
}

impl Receivers {
    pub(crate) fn channel(capacity: usize) -> (EventSinks, Self) {
        let (join_tx, join) = mpsc::channel(capacity);
        let (leave_tx, leave) = mpsc::channel(capacity);
        let (update_tx, update) = mpsc::channel(capacity);
        let sinks = EventSinks::default()
            .with_join(join_tx)
            .with_leave(leave_tx)
            .with_update(update_tx);
        (sinks, Self { join, leave, update })
    }
}

fn drain_into(rx: &mut mpsc::Receiver<Member>, names: &mut Vec<String>) {
    while let Ok(member) = rx.try_recv() {
        names.push(member.name);
    }
}

/// A cluster member running over the simulated network
pub struct SimNode {
    name: String,
    membership: Membership<SimTransport>,
    receivers: Receivers,
    log: EventLog,
    state: SimNodeState,
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

impl SimNode {
    pub(crate) fn new(name: String, membership: Membership<SimTransport>, receivers: Receivers) -> Self {
        Self {
            name,
            membership,
            receivers,
            log: EventLog::default(),
            state: SimNodeState::Running,
        }
    }

    /// Node name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.membership.local_node().addr()
    }

    /// Membership handle
    #[must_use]
    pub fn membership(&self) -> &Membership<SimTransport> {
        &self.membership
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SimNodeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SimNodeState) {
        self.state = state;
    }

    /// Check if the node is running and reachable
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == SimNodeState::Running
    }

    /// Names of live members this node knows, itself included
    #[must_use]
    pub fn live_names(&self) -> Vec<String> {
        self.membership
            .members()
            .map(|members| members.into_iter().map(|m| m.name).collect())
            .unwrap_or_default()
    }

    /// Collect delivered events and return everything seen so far
    pub fn events(&mut self) -> &EventLog {
        drain_into(&mut self.receivers.join, &mut self.log.joined);
        drain_into(&mut self.receivers.leave, &mut self.log.left);
        drain_into(&mut self.receivers.update, &mut self.log.updated);
        &self.log
    }
}
