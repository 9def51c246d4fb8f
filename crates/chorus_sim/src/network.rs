//! In-memory network.
//!
//! [`SimNetwork`] is a hub that routes datagrams and streams between
//! [`SimTransport`] endpoints inside one process. Loss and latency are drawn
//! from a seeded RNG; partitions and crashes cut links until healed. Under a
//! paused tokio clock, runs are reproducible.

use crate::seed::SimSeed;
use async_trait::async_trait;
use bytes::Bytes;
use chorus_cluster::{StreamConn, Transport, TransportError, TransportResult};
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Port every simulated node listens on
pub const SIM_PORT: u16 = 7946;

/// Distinct addresses one network hands out, all under 10.0.0.0/8
pub const MAX_HOSTS: u32 = (1 << 24) - 2;

/// Link quality applied to every datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkCondition {
    /// Probability that a datagram is lost, 0.0 to 1.0
    pub loss: f64,
    /// Fixed one-way delay
    pub latency: Duration,
    /// Upper bound of random extra delay
    pub jitter: Duration,
}

impl NetworkCondition {
    /// Lossless, instant delivery
    #[must_use]
    pub fn perfect() -> Self {
        Self {
            loss: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Set loss probability
    #[must_use]
    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss.clamp(0.0, 1.0);
        self
    }

    /// Set latency and jitter
    #[must_use]
    pub fn with_latency(mut self, latency: Duration, jitter: Duration) -> Self {
        self.latency = latency;
        self.jitter = jitter;
        self
    }

    /// Draw whether a datagram survives
    pub fn is_delivered(&self, rng: &mut ChaCha8Rng) -> bool {
        self.loss <= 0.0 || rng.r#gen::<f64>() >= self.loss
    }

    /// Draw a delivery delay
    pub fn delay(&self, rng: &mut ChaCha8Rng) -> Duration {
        if self.jitter.is_zero() {
            return self.latency;
        }
        self.latency + self.jitter.mul_f64(rng.r#gen::<f64>())
    }
}

impl Default for NetworkCondition {
    fn default() -> Self {
        Self::perfect()
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Datagrams handed to a receiver
    pub delivered: u64,
    /// Datagrams lost to loss, partitions, crashes, or unknown addresses
    pub dropped: u64,
    /// Streams opened
    pub streams: u64,
}

type Datagram = (SocketAddr, Bytes);

struct Endpoint {
    id: u64,
    datagrams: mpsc::UnboundedSender<Datagram>,
    streams: mpsc::UnboundedSender<(SocketAddr, SimStream)>,
}

struct Inner {
    endpoints: HashMap<SocketAddr, Endpoint>,
    groups: Vec<HashSet<SocketAddr>>,
    crashed: HashSet<SocketAddr>,
    condition: NetworkCondition,
    rng: ChaCha8Rng,
    next_host: u32,
    next_id: u64,
    stats: NetworkStats,
}

impl Inner {
    fn can_reach(&self, from: SocketAddr, to: SocketAddr) -> bool {
        if self.crashed.contains(&from) || self.crashed.contains(&to) {
            return false;
        }
        for group in &self.groups {
            let from_in = group.contains(&from);
            let to_in = group.contains(&to);
            if from_in || to_in {
                return from_in && to_in;
            }
        }
        true
    }
}

/// Shared simulated network
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimNetwork")
            .field("endpoints", &inner.endpoints.len())
            .field("partitions", &inner.groups.len())
            .field("crashed", &inner.crashed.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl SimNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new(seed: &SimSeed) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                endpoints: HashMap::new(),
                groups: Vec::new(),
                crashed: HashSet::new(),
                condition: NetworkCondition::default(),
                rng: seed.derive("network").rng(),
                next_host: 0,
                next_id: 0,
                stats: NetworkStats::default(),
            })),
        }
    }

    /// Allocate a fresh address under 10.0.0.0/8 on [`SIM_PORT`], or
    /// `None` once [`MAX_HOSTS`] addresses are taken
    #[must_use]
    pub fn next_addr(&self) -> Option<SocketAddr> {
        let mut inner = self.inner.lock();
        if inner.next_host >= MAX_HOSTS {
            return None;
        }
        inner.next_host += 1;
        let ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 0, 0)) | inner.next_host);
        Some(SocketAddr::from((ip, SIM_PORT)))
    }

    /// Attach an endpoint at `addr`, replacing any previous one
    #[must_use]
    pub fn bind(&self, addr: SocketAddr) -> SimTransport {
        let (dgram_tx, dgram_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.endpoints.insert(
                addr,
                Endpoint {
                    id,
                    datagrams: dgram_tx,
                    streams: stream_tx,
                },
            );
            id
        };
        SimTransport {
            network: self.clone(),
            addr,
            id,
            datagrams: tokio::sync::Mutex::new(dgram_rx),
            streams: tokio::sync::Mutex::new(stream_rx),
            closed: CancellationToken::new(),
        }
    }

    /// Attach an endpoint at a fresh address, or `None` once the address
    /// space is used up
    #[must_use]
    pub fn transport(&self) -> Option<SimTransport> {
        self.next_addr().map(|addr| self.bind(addr))
    }

    fn unbind(&self, addr: SocketAddr, id: u64) {
        let mut inner = self.inner.lock();
        if inner.endpoints.get(&addr).is_some_and(|e| e.id == id) {
            inner.endpoints.remove(&addr);
        }
    }

    /// Set link quality for all traffic
    pub fn set_condition(&self, condition: NetworkCondition) {
        self.inner.lock().condition = condition;
    }

    /// Split the network: nodes in a group only reach nodes in the same
    /// group. Nodes in no group are unaffected.
    pub fn partition(&self, groups: Vec<Vec<SocketAddr>>) {
        self.inner.lock().groups = groups
            .into_iter()
            .map(|g| g.into_iter().collect())
            .collect();
    }

    /// Remove all partitions
    pub fn heal(&self) {
        self.inner.lock().groups.clear();
    }

    /// Silence `addr`: all its traffic is dropped until restored
    pub fn crash(&self, addr: SocketAddr) {
        self.inner.lock().crashed.insert(addr);
    }

    /// Undo [`SimNetwork::crash`]
    pub fn restore(&self, addr: SocketAddr) {
        self.inner.lock().crashed.remove(&addr);
    }

    /// Check if `from` can currently reach `to`
    #[must_use]
    pub fn can_reach(&self, from: SocketAddr, to: SocketAddr) -> bool {
        self.inner.lock().can_reach(from, to)
    }

    /// Delivery counters
    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        self.inner.lock().stats
    }

    fn route_datagram(
        &self,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Option<(mpsc::UnboundedSender<Datagram>, Duration)> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let reachable = inner.can_reach(from, to) && inner.condition.is_delivered(&mut inner.rng);
        let target = inner.endpoints.get(&to).map(|e| e.datagrams.clone());
        match (reachable, target) {
            (true, Some(tx)) => {
                inner.stats.delivered += 1;
                Some((tx, inner.condition.delay(&mut inner.rng)))
            }
            _ => {
                inner.stats.dropped += 1;
                None
            }
        }
    }

    fn connect(&self, from: SocketAddr, to: SocketAddr) -> TransportResult<SimStream> {
        let mut inner = self.inner.lock();
        if !inner.can_reach(from, to) {
            return Err(TransportError::Unreachable(to));
        }
        let Some(endpoint) = inner.endpoints.get(&to) else {
            return Err(TransportError::Unreachable(to));
        };

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let server = SimStream {
            network: self.clone(),
            local: to,
            peer: from,
            tx: server_tx,
            rx: server_rx,
        };
        endpoint
            .streams
            .send((from, server))
            .map_err(|_| TransportError::Unreachable(to))?;
        inner.stats.streams += 1;

        Ok(SimStream {
            network: self.clone(),
            local: from,
            peer: to,
            tx: client_tx,
            rx: client_rx,
        })
    }
}

/// One side of a simulated stream
pub struct SimStream {
    network: SimNetwork,
    local: SocketAddr,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl std::fmt::Debug for SimStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamConn for SimStream {
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        if !self.network.can_reach(self.local, self.peer) {
            return Err(TransportError::Unreachable(self.peer));
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&mut self) -> TransportResult<Bytes> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// A node's attachment to a [`SimNetwork`]
pub struct SimTransport {
    network: SimNetwork,
    addr: SocketAddr,
    id: u64,
    datagrams: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    streams: tokio::sync::Mutex<mpsc::UnboundedReceiver<(SocketAddr, SimStream)>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("addr", &self.addr)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Stream = SimStream;

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_datagram(&self, to: SocketAddr, payload: Bytes) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let Some((tx, delay)) = self.network.route_datagram(self.addr, to) else {
            trace!(from = %self.addr, %to, "datagram dropped");
            return Ok(());
        };
        let from = self.addr;
        if delay.is_zero() {
            let _ = tx.send((from, payload));
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send((from, payload));
            });
        }
        Ok(())
    }

    async fn recv_datagram(&self) -> TransportResult<(SocketAddr, Bytes)> {
        let mut rx = self.datagrams.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            received = rx.recv() => received.ok_or(TransportError::Closed),
        }
    }

    async fn open_stream(&self, to: SocketAddr) -> TransportResult<SimStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.network.connect(self.addr, to)
    }

    async fn accept_stream(&self) -> TransportResult<(SocketAddr, SimStream)> {
        let mut rx = self.streams.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            received = rx.recv() => received.ok_or(TransportError::Closed),
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
        self.network.unbind(self.addr, self.id);
    }
}
