//! The membership handle.
//!
//! [`Membership`] is what applications hold: it starts the protocol tasks
//! for one node, answers membership queries from the local table, and
//! shuts everything down. Handles are cheap to clone and share one node.

use crate::engine::Engine;
use crate::error::{ClusterError, ClusterResult};
use crate::probe::AckTable;
use crate::scheduler::Scheduler;
use crate::transport::Transport;
use crate::{Config, ConfigError};
use bytes::Bytes;
use chorus_core::{Member, Message, Node};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn};

/// State shared by a node's handles and background tasks
pub(crate) struct Shared<T: Transport> {
    pub(crate) config: Config,
    pub(crate) transport: T,
    pub(crate) local: Node,
    pub(crate) engine: Mutex<Engine>,
    pub(crate) acks: AckTable,
    pub(crate) suspicion_wake: Notify,
    pub(crate) scheduler: Scheduler,
    seq: AtomicU32,
    shutdown: AtomicBool,
}

impl<T: Transport> Shared<T> {
    fn new(config: Config, transport: T) -> ClusterResult<Self> {
        config.validate()?;
        let addr = config
            .advertise_addr
            .unwrap_or_else(|| transport.local_addr());
        if addr.ip().is_unspecified() {
            return Err(ConfigError::UnspecifiedAdvertiseAddr(addr).into());
        }

        let local = Member::new(config.name.clone(), addr).with_meta(config.meta.clone());
        let engine = Engine::new(&config, local);
        let span = info_span!("chorus", node = %config.name);
        Ok(Self {
            local: Node::new(config.name.clone(), addr),
            engine: Mutex::new(engine),
            acks: AckTable::default(),
            suspicion_wake: Notify::new(),
            scheduler: Scheduler::new().with_span(span),
            seq: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            config,
            transport,
        })
    }

    pub(crate) fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> ClusterResult<()> {
        if self.is_shutdown() {
            return Err(ClusterError::Shutdown);
        }
        Ok(())
    }

    /// Wake the suspicion timer after suspicions may have changed
    pub(crate) fn suspicions_changed(&self) {
        self.suspicion_wake.notify_one();
    }

    /// Send `message` with piggybacked gossip; failures are logged only
    pub(crate) async fn send(&self, to: SocketAddr, message: Message) {
        let packet = self.engine.lock().packet(message);
        let bytes = match packet.encode_bounded(self.config.packet_budget) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%to, kind = packet.message.kind(), error = %e, "cannot encode packet");
                return;
            }
        };
        if let Err(e) = self.transport.send_datagram(to, Bytes::from(bytes)).await {
            debug!(%to, kind = packet.message.kind(), error = %e, "send failed");
        }
    }

    fn start_listeners(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        self.scheduler
            .spawn("receiver", async move { shared.run_receiver().await });
        let shared = Arc::clone(self);
        self.scheduler
            .spawn("acceptor", async move { shared.run_acceptor().await });
        let shared = Arc::clone(self);
        self.scheduler
            .spawn("suspicion", async move { shared.run_suspicion_timers().await });
    }

    fn start_periodic(self: &Arc<Self>) {
        let config = &self.config;

        let shared = Arc::clone(self);
        self.scheduler
            .spawn_periodic("probe", config.probe_interval, move || {
                let shared = Arc::clone(&shared);
                async move { shared.probe_round().await }
            });

        let shared = Arc::clone(self);
        self.scheduler
            .spawn_periodic("gossip", config.gossip_interval, move || {
                let shared = Arc::clone(&shared);
                async move {
                    shared.gossip_round().await;
                }
            });

        let shared = Arc::clone(self);
        self.scheduler
            .spawn_periodic("push-pull", config.push_pull_interval, move || {
                let shared = Arc::clone(&shared);
                async move { shared.periodic_push_pull().await }
            });

        let shared = Arc::clone(self);
        self.scheduler
            .spawn_periodic("reaper", config.reap_interval, move || {
                let shared = Arc::clone(&shared);
                async move {
                    let ttl = shared.config.tombstone_ttl;
                    shared.engine.lock().reap(Instant::now(), ttl);
                }
            });
    }

    /// Push/pull with each seed in order.
    ///
    /// With `stop_at_first` the first successful exchange ends the walk.
    /// A duplicate name aborts immediately.
    async fn join_seeds(&self, seeds: &[SocketAddr], stop_at_first: bool) -> ClusterResult<usize> {
        let mut joined = 0;
        for &seed in seeds {
            if seed == self.local.addr() {
                debug!(%seed, "skipping own address");
                continue;
            }
            match self.push_pull_with(seed, true).await {
                Ok(()) => {
                    info!(%seed, "joined via seed");
                    joined += 1;
                    if stop_at_first {
                        break;
                    }
                }
                Err(e @ ClusterError::DuplicateName { .. }) => return Err(e),
                Err(e) => warn!(%seed, error = %e, "seed did not respond"),
            }
        }
        Ok(joined)
    }

    async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.stop().await;
        self.transport.shutdown().await;
        info!(node = %self.local, "membership shut down");
    }
}

/// Handle to one running cluster member
pub struct Membership<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Membership<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Membership<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("local", &self.shared.local)
            .field("shutdown", &self.shared.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Membership<T> {
    /// Start a new cluster containing only this node
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] if the configuration is invalid
    pub async fn create(config: Config, transport: T) -> ClusterResult<Self> {
        let shared = Arc::new(Shared::new(config, transport)?);
        shared.start_listeners();
        shared.start_periodic();
        info!(node = %shared.local, "created cluster");
        Ok(Self { shared })
    }

    /// Join an existing cluster through `seeds`.
    ///
    /// Seeds are tried in order and the first successful push/pull
    /// completes the join.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::JoinFailed`] if no seed responds,
    /// [`ClusterError::DuplicateName`] if a live member already uses this
    /// node's name, or [`ClusterError::Config`] for invalid configuration
    pub async fn join(config: Config, transport: T, seeds: &[SocketAddr]) -> ClusterResult<Self> {
        let shared = Arc::new(Shared::new(config, transport)?);
        shared.start_listeners();

        match shared.join_seeds(seeds, true).await {
            Ok(0) => {
                shared.shutdown().await;
                return Err(ClusterError::JoinFailed {
                    attempted: seeds.len(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                shared.shutdown().await;
                return Err(e);
            }
        }

        shared.start_periodic();
        Ok(Self { shared })
    }

    /// Contact every seed, returning how many answered
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] after shutdown, or
    /// [`ClusterError::DuplicateName`] on a name conflict
    pub async fn join_peers(&self, seeds: &[SocketAddr]) -> ClusterResult<usize> {
        self.shared.ensure_running()?;
        self.shared.join_seeds(seeds, false).await
    }

    /// Live members (Alive and Suspect), this node included, ordered by name
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] after shutdown
    pub fn members(&self) -> ClusterResult<Vec<Member>> {
        self.shared.ensure_running()?;
        Ok(self.shared.engine.lock().table().members())
    }

    /// Every known record, tombstones included, ordered by name
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] after shutdown
    pub fn snapshot(&self) -> ClusterResult<Vec<Member>> {
        self.shared.ensure_running()?;
        Ok(self.shared.engine.lock().table().snapshot())
    }

    /// Number of live members
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] after shutdown
    pub fn num_members(&self) -> ClusterResult<usize> {
        self.shared.ensure_running()?;
        Ok(self.shared.engine.lock().table().len_live())
    }

    /// This node's current record
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] after shutdown
    pub fn local_member(&self) -> ClusterResult<Member> {
        self.shared.ensure_running()?;
        Ok(self.shared.engine.lock().local().clone())
    }

    /// This node's identity
    #[must_use]
    pub fn local_node(&self) -> &Node {
        &self.shared.local
    }

    /// Configuration the node runs with
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Events dropped because an application channel was full
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] after shutdown
    pub fn dropped_events(&self) -> ClusterResult<u64> {
        self.shared.ensure_running()?;
        Ok(self.shared.engine.lock().dropped_events())
    }

    /// Replace this node's metadata and gossip it under a new incarnation
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] after shutdown
    pub fn update_meta(&self, meta: Vec<u8>) -> ClusterResult<Member> {
        self.shared.ensure_running()?;
        let member = self.shared.engine.lock().update_meta(meta);
        info!(node = %member.name, incarnation = %member.incarnation, "metadata updated");
        Ok(member)
    }

    /// Exchange full state with `addr` now
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or times out
    pub async fn push_pull(&self, addr: SocketAddr) -> ClusterResult<()> {
        self.shared.ensure_running()?;
        self.shared.push_pull_with(addr, false).await
    }

    /// Announce departure, then shut down.
    ///
    /// The Left record is gossiped until its transmit budget is spent or
    /// `timeout` passes, whichever is first. Dissemination is best effort:
    /// a timeout is logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Shutdown`] if already shut down
    pub async fn leave(&self, timeout: Duration) -> ClusterResult<()> {
        self.shared.ensure_running()?;
        let member = self.shared.engine.lock().leave();
        info!(node = %member.name, "leaving cluster");

        let shared = &self.shared;
        let pause = if shared.config.gossip_interval.is_zero() {
            shared.config.probe_interval
        } else {
            shared.config.gossip_interval
        };
        let announce = async {
            loop {
                if shared.gossip_round().await == 0 {
                    break;
                }
                if !shared.engine.lock().is_pending(&member.name) {
                    break;
                }
                tokio::time::sleep(pause).await;
            }
        };
        if tokio::time::timeout(timeout, announce).await.is_err() {
            warn!(node = %member.name, ?timeout, "leave not fully disseminated before timeout");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every background task and close the transport. Idempotent.
    ///
    /// Afterwards, operations return [`ClusterError::Shutdown`].
    pub async fn shutdown(&self) {
        self.shared.shutdown().await;
    }

    /// Check if the node was shut down
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }
}
