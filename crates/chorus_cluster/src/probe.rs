//! Failure detection.
//!
//! Each probe round pings one member directly. If no ack arrives within
//! the probe timeout, up to `indirect_checks` other members are asked to
//! ping it on our behalf. If neither a direct nor an indirect ack arrives
//! before the probe interval ends, the member becomes Suspect. Suspicions
//! are turned into deaths by a separate timer task.

use crate::membership::Shared;
use crate::state::MemberTable;
use crate::transport::Transport;
use chorus_core::{Member, Message, Node};
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

/// Round-robin probe order over a shuffled member list.
///
/// The list is reshuffled at the start of every pass, so each live member
/// is probed once per pass and detection latency is bounded by the pass
/// length.
#[derive(Debug, Default)]
pub struct ProbeRing {
    order: Vec<String>,
    pos: usize,
}

impl ProbeRing {
    /// Next live member to probe, or `None` if there are no peers
    pub fn next<R: Rng + ?Sized>(&mut self, table: &MemberTable, rng: &mut R) -> Option<Member> {
        let mut reshuffled = false;
        loop {
            if self.pos >= self.order.len() {
                if reshuffled {
                    return None;
                }
                self.order = table.peers().map(|m| m.name.clone()).collect();
                self.order.shuffle(rng);
                self.pos = 0;
                reshuffled = true;
            }
            let name = self.order.get(self.pos)?;
            self.pos += 1;
            if let Some(member) = table.get(name).filter(|m| m.is_live()) {
                return Some(member.clone());
            }
        }
    }
}

/// Outstanding probes waiting for an ack, keyed by sequence number
#[derive(Debug, Default)]
pub(crate) struct AckTable {
    pending: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

impl AckTable {
    /// Start waiting for `seq`
    pub(crate) fn register(&self, seq: u32) -> AckWaiter<'_> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);
        AckWaiter {
            table: self,
            seq,
            rx,
        }
    }

    /// Deliver an ack. Returns false if nobody is waiting for `seq`.
    pub(crate) fn resolve(&self, seq: u32) -> bool {
        match self.pending.lock().remove(&seq) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A registered probe; dropping it unregisters the sequence number
pub(crate) struct AckWaiter<'a> {
    table: &'a AckTable,
    seq: u32,
    rx: oneshot::Receiver<()>,
}

impl AckWaiter<'_> {
    /// Wait for the ack until `deadline`. Can be called again with a later
    /// deadline after a miss.
    pub(crate) async fn wait_until(&mut self, deadline: Instant) -> bool {
        matches!(tokio::time::timeout_at(deadline, &mut self.rx).await, Ok(Ok(())))
    }
}

impl Drop for AckWaiter<'_> {
    fn drop(&mut self) {
        self.table.pending.lock().remove(&self.seq);
    }
}

impl<T: Transport> Shared<T> {
    /// One probe round against the next member in the ring
    pub(crate) async fn probe_round(self: &Arc<Self>) {
        let Some(target) = self.engine.lock().next_probe_target() else {
            return;
        };
        let started = Instant::now();
        let seq = self.next_seq();
        let mut waiter = self.acks.register(seq);

        self.send(
            target.addr,
            Message::Ping {
                seq,
                target: target.name.clone(),
            },
        )
        .await;
        if waiter.wait_until(started + self.config.probe_timeout()).await {
            return;
        }

        let relays = self
            .engine
            .lock()
            .indirect_relays(self.config.indirect_checks, &target.name);
        debug!(target = %target.name, relays = relays.len(), "direct probe missed");
        for relay in &relays {
            self.send(
                relay.addr(),
                Message::IndirectPing {
                    seq,
                    target: target.node(),
                },
            )
            .await;
        }
        if waiter.wait_until(started + self.config.probe_interval).await {
            return;
        }
        drop(waiter);

        if self.is_shutdown() {
            return;
        }
        let changed = self.engine.lock().suspect(&target.name, Instant::now());
        if changed {
            info!(target = %target.name, "probe failed, suspecting member");
            self.suspicions_changed();
        }
    }

    /// Probe `target` for `requester` and report success with an indirect ack
    pub(crate) async fn relay_probe(&self, requester: SocketAddr, seq: u32, target: Node) {
        let relay_seq = self.next_seq();
        let mut waiter = self.acks.register(relay_seq);
        self.send(
            target.addr(),
            Message::Ping {
                seq: relay_seq,
                target: target.name().to_string(),
            },
        )
        .await;

        if waiter
            .wait_until(Instant::now() + self.config.probe_timeout())
            .await
        {
            self.send(requester, Message::IndirectAck { seq }).await;
        } else {
            debug!(target = %target, %requester, "relayed probe missed");
        }
    }

    /// Declare members dead as their suspicion deadlines pass
    pub(crate) async fn run_suspicion_timers(self: Arc<Self>) {
        loop {
            let next = self.engine.lock().next_suspicion_deadline();
            let deadline = async move {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = self.suspicion_wake.notified() => {}
                () = deadline => {
                    self.engine.lock().expire(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::time::Duration;

    fn table(names: &[&str]) -> MemberTable {
        let mut t = MemberTable::new(Member::new("local", "10.0.0.1:7946".parse().unwrap()));
        for (i, name) in names.iter().enumerate() {
            let addr = std::net::SocketAddr::from(([10, 0, 1, i as u8], 7946));
            t.merge(&Member::new(*name, addr), Instant::now());
        }
        t
    }

    #[test]
    fn test_ring_empty_without_peers() {
        let mut ring = ProbeRing::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(ring.next(&table(&[]), &mut rng).is_none());
    }

    #[test]
    fn test_ring_visits_each_member_once_per_pass() {
        let t = table(&["a", "b", "c", "d"]);
        let mut ring = ProbeRing::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        for _ in 0..3 {
            let mut pass: Vec<String> = (0..4)
                .filter_map(|_| ring.next(&t, &mut rng))
                .map(|m| m.name)
                .collect();
            pass.sort();
            assert_eq!(pass, vec!["a", "b", "c", "d"]);
        }
    }

    #[test]
    fn test_ring_skips_members_that_died_mid_pass() {
        let mut t = table(&["a", "b"]);
        let mut ring = ProbeRing::default();
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let first = ring.next(&t, &mut rng).unwrap();
        let other = if first.name == "a" { "b" } else { "a" };
        let dead = t
            .get(other)
            .cloned()
            .unwrap()
            .with_status(chorus_core::MemberStatus::Dead);
        t.merge(&dead, Instant::now());

        // the pass ends early, and the next pass only holds `first`
        assert_eq!(ring.next(&t, &mut rng).unwrap().name, first.name);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resolves_waiter() {
        let acks = AckTable::default();
        let mut waiter = acks.register(7);
        assert!(acks.resolve(7));
        assert!(waiter.wait_until(Instant::now() + Duration::from_secs(1)).await);
        assert!(!acks.resolve(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_times_out_then_accepts_late_ack() {
        let acks = AckTable::default();
        let mut waiter = acks.register(9);
        let start = Instant::now();
        assert!(!waiter.wait_until(start + Duration::from_millis(200)).await);

        assert!(acks.resolve(9));
        assert!(waiter.wait_until(start + Duration::from_secs(1)).await);
    }

    #[test]
    fn test_dropped_waiter_unregisters() {
        let acks = AckTable::default();
        let waiter = acks.register(1);
        assert_eq!(acks.len(), 1);
        drop(waiter);
        assert_eq!(acks.len(), 0);
        assert!(!acks.resolve(1));
    }
}
