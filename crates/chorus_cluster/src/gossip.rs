//! Datagram handling and gossip rounds.

use crate::membership::Shared;
use crate::transport::{Transport, TransportError};
use bytes::Bytes;
use chorus_core::{Decode, Message, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

impl<T: Transport> Shared<T> {
    /// Receive datagrams until the transport closes
    pub(crate) async fn run_receiver(self: Arc<Self>) {
        loop {
            match self.transport.recv_datagram().await {
                Ok((from, payload)) => self.handle_datagram(from, payload).await,
                Err(TransportError::Closed) => break,
                Err(e) => debug!(error = %e, "receive failed"),
            }
        }
    }

    /// Apply a datagram's gossip, then act on its message
    pub(crate) async fn handle_datagram(self: &Arc<Self>, from: SocketAddr, payload: Bytes) {
        let packet = match Packet::decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%from, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        if !packet.gossip.is_empty() {
            let changed = self.engine.lock().apply_all(&packet.gossip, Instant::now());
            if changed {
                self.suspicions_changed();
            }
        }

        match packet.message {
            Message::Ping { seq, target } => {
                if target != self.local.name() {
                    debug!(%from, %target, "dropping probe addressed to another node");
                    return;
                }
                self.send(from, Message::Ack { seq }).await;
            }
            Message::Ack { seq } | Message::IndirectAck { seq } => {
                if !self.acks.resolve(seq) {
                    debug!(%from, seq, "ack for unknown or expired probe");
                }
            }
            Message::IndirectPing { seq, target } => {
                let shared = Arc::clone(self);
                self.scheduler.spawn("relay", async move {
                    shared.relay_probe(from, seq, target).await;
                });
            }
            Message::Gossip => {}
            message @ Message::PushPull { .. } => {
                warn!(%from, kind = message.kind(), "dropping stream message received as datagram");
            }
        }
    }

    /// Send pending gossip to a few random peers, each with its own
    /// piggyback selection. Returns the number of packets sent.
    pub(crate) async fn gossip_round(&self) -> usize {
        let targets = {
            let mut engine = self.engine.lock();
            if !engine.has_gossip() {
                return 0;
            }
            engine.gossip_targets(
                self.config.gossip_nodes.max(1),
                Instant::now(),
                self.config.tombstone_ttl,
            )
        };

        let mut sent = 0;
        for target in targets {
            if !self.engine.lock().has_gossip() {
                break;
            }
            self.send(target.addr(), Message::Gossip).await;
            sent += 1;
        }
        sent
    }
}
