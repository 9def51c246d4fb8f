//! Protocol state under one lock.
//!
//! [`Engine`] owns the member table, open suspicions, the gossip queue, the
//! probe order, and the random source. The membership handle keeps it
//! behind a single mutex; every method is synchronous and performs no I/O,
//! so the lock is only ever held for in-memory work.

use crate::broadcast::BroadcastQueue;
use crate::events::EventBus;
use crate::probe::ProbeRing;
use crate::state::{MemberTable, MergeOutcome};
use crate::suspicion::SuspicionTable;
use crate::Config;
use chorus_core::{Encode, Member, MemberStatus, Message, Node, Packet, Update};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Varint length prefix of the gossip vector
const GOSSIP_LEN_PREFIX: usize = 5;

/// Per-node protocol state
#[derive(Debug)]
pub struct Engine {
    table: MemberTable,
    suspicions: SuspicionTable,
    broadcasts: BroadcastQueue,
    ring: ProbeRing,
    rng: ChaCha8Rng,
    events: EventBus,
    packet_budget: usize,
    leaving: bool,
}

impl Engine {
    /// Create state holding only `local`
    #[must_use]
    pub fn new(config: &Config, local: Member) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            table: MemberTable::new(local),
            suspicions: SuspicionTable::new(config.suspicion_policy()),
            broadcasts: BroadcastQueue::new(config.retransmit_mult, config.broadcast_capacity),
            ring: ProbeRing::default(),
            rng,
            events: EventBus::new(config.events.clone()),
            packet_budget: config.packet_budget,
            leaving: false,
        }
    }

    /// Name of the local node
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.table.local().name
    }

    /// The local node's record
    #[must_use]
    pub fn local(&self) -> &Member {
        self.table.local()
    }

    /// Read access to the member table
    #[must_use]
    pub const fn table(&self) -> &MemberTable {
        &self.table
    }

    /// Read access to open suspicions
    #[must_use]
    pub const fn suspicions(&self) -> &SuspicionTable {
        &self.suspicions
    }

    /// Live cluster size as seen locally, never zero
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.table.len_live().max(1)
    }

    /// Check if the local node is leaving
    #[must_use]
    pub const fn is_leaving(&self) -> bool {
        self.leaving
    }

    /// Apply one gossiped update.
    ///
    /// Accepted changes update suspicions, emit their event, and are queued
    /// for further dissemination. A Suspect claim matching an open suspicion
    /// counts as a confirmation from its origin. Claims against the local
    /// node are refuted. Returns true if anything changed.
    pub fn apply(&mut self, update: &Update, now: Instant) -> bool {
        let member = &update.member;
        let n = self.cluster_size();

        match self.table.merge(member, now) {
            MergeOutcome::Contested { claimed } => {
                if self.leaving {
                    return false;
                }
                let refuted = self.table.refute(claimed);
                info!(
                    node = %refuted.name,
                    claim = %member.status,
                    from = %update.origin,
                    incarnation = %refuted.incarnation,
                    "refuting claim about local node"
                );
                self.enqueue(refuted);
                true
            }
            MergeOutcome::Unchanged => {
                if member.status != MemberStatus::Suspect {
                    return false;
                }
                let confirmed = self.suspicions.confirm(
                    &member.name,
                    member.incarnation,
                    &update.origin,
                    n,
                );
                if confirmed {
                    debug!(member = %member.name, witness = %update.origin, "suspicion confirmed");
                    self.broadcasts.enqueue(update.clone(), n);
                }
                confirmed
            }
            outcome @ MergeOutcome::Applied { .. } => {
                if member.status == MemberStatus::Suspect {
                    self.suspicions
                        .start(&member.name, member.incarnation, &update.origin, now, n);
                } else {
                    self.suspicions.remove(&member.name);
                }
                match member.status {
                    MemberStatus::Dead | MemberStatus::Left => {
                        info!(member = %member, from = %update.origin, "member down");
                    }
                    _ => debug!(member = %member, from = %update.origin, "member updated"),
                }
                if let Some(event) = outcome.into_event() {
                    self.events.emit(event);
                }
                self.broadcasts.enqueue(update.clone(), self.cluster_size());
                true
            }
        }
    }

    /// Apply every update piggybacked on a packet
    pub fn apply_all(&mut self, updates: &[Update], now: Instant) -> bool {
        let mut changed = false;
        for update in updates {
            changed |= self.apply(update, now);
        }
        changed
    }

    /// Merge a full remote snapshot received over push/pull.
    ///
    /// A remote Dead claim about a member we hold live is applied as
    /// Suspect, so the member gets a chance to refute.
    pub fn merge_remote_state(&mut self, members: &[Member], from: &str, now: Instant) -> bool {
        let mut changed = false;
        for member in members {
            let mut member = member.clone();
            if member.status == MemberStatus::Dead
                && member.name != self.local_name()
                && self.table.get(&member.name).is_some_and(Member::is_live)
            {
                member.status = MemberStatus::Suspect;
            }
            changed |= self.apply(&Update::new(member, from), now);
        }
        changed
    }

    /// Suspect a member that missed its probe
    pub fn suspect(&mut self, name: &str, now: Instant) -> bool {
        let Some(member) = self.table.get(name).filter(|m| m.is_live()) else {
            return false;
        };
        let suspect = member.clone().with_status(MemberStatus::Suspect);
        let origin = self.local_name().to_string();
        self.apply(&Update::new(suspect, origin), now)
    }

    /// Declare Dead every member whose suspicion ran out
    pub fn expire(&mut self, now: Instant) -> Vec<Member> {
        let origin = self.local_name().to_string();
        let mut dead = Vec::new();
        for suspicion in self.suspicions.take_expired(now) {
            let Some(member) = self.table.get(&suspicion.name) else {
                continue;
            };
            if member.status != MemberStatus::Suspect || member.incarnation != suspicion.incarnation {
                continue;
            }
            let record = member.clone().with_status(MemberStatus::Dead);
            warn!(
                member = %record.name,
                confirmations = suspicion.confirmations(),
                "suspicion timed out, declaring dead"
            );
            if self.apply(&Update::new(record.clone(), origin.clone()), now) {
                dead.push(record);
            }
        }
        dead
    }

    /// Queue a record about the local node
    fn enqueue(&mut self, member: Member) {
        let origin = self.local_name().to_string();
        let n = self.cluster_size();
        self.broadcasts.enqueue(Update::new(member, origin), n);
    }

    /// Replace the local metadata and gossip it
    pub fn update_meta(&mut self, meta: Vec<u8>) -> Member {
        let member = self.table.update_local_meta(meta);
        self.enqueue(member.clone());
        member
    }

    /// Mark the local node Left and gossip it
    pub fn leave(&mut self) -> Member {
        self.leaving = true;
        let member = self.table.mark_local_left();
        self.enqueue(member.clone());
        member
    }

    /// Check if an update about `name` is still being disseminated
    #[must_use]
    pub fn is_pending(&self, name: &str) -> bool {
        self.broadcasts.contains(name)
    }

    /// Wrap `message` in a packet with as much pending gossip as fits
    pub fn packet(&mut self, message: Message) -> Packet {
        let packet = Packet::new(message);
        let budget = self
            .packet_budget
            .saturating_sub(packet.encoded_len() + GOSSIP_LEN_PREFIX);
        let gossip = self.broadcasts.piggyback(budget);
        packet.with_gossip(gossip)
    }

    /// Check if gossip is waiting to be sent
    #[must_use]
    pub fn has_gossip(&self) -> bool {
        !self.broadcasts.is_empty()
    }

    /// Next member to probe
    pub fn next_probe_target(&mut self) -> Option<Member> {
        self.ring.next(&self.table, &mut self.rng)
    }

    /// Up to `k` Alive members other than `exclude`, in random order
    pub fn indirect_relays(&mut self, k: usize, exclude: &str) -> Vec<Node> {
        let candidates: Vec<Node> = self
            .table
            .peers()
            .filter(|m| m.status == MemberStatus::Alive && m.name != exclude)
            .map(Member::node)
            .collect();
        candidates
            .choose_multiple(&mut self.rng, k)
            .cloned()
            .collect()
    }

    /// Up to `k` gossip targets: live members and members dead less than
    /// `dead_window` ago
    pub fn gossip_targets(&mut self, k: usize, now: Instant, dead_window: Duration) -> Vec<Node> {
        let candidates: Vec<Node> = self
            .table
            .peers()
            .cloned()
            .chain(self.table.recently_dead(now, dead_window))
            .map(|m| m.node())
            .collect();
        candidates
            .choose_multiple(&mut self.rng, k)
            .cloned()
            .collect()
    }

    /// Random Alive member for a push/pull exchange
    pub fn push_pull_target(&mut self) -> Option<Node> {
        let candidates: Vec<Node> = self
            .table
            .peers()
            .filter(|m| m.status == MemberStatus::Alive)
            .map(Member::node)
            .collect();
        candidates.choose(&mut self.rng).cloned()
    }

    /// Earliest open suspicion deadline
    #[must_use]
    pub fn next_suspicion_deadline(&self) -> Option<Instant> {
        self.suspicions.next_deadline()
    }

    /// Drop tombstones older than `ttl`
    pub fn reap(&mut self, now: Instant, ttl: Duration) -> Vec<Member> {
        let reaped = self.table.reap(now, ttl);
        for member in &reaped {
            debug!(member = %member.name, "reaped tombstone");
        }
        reaped
    }

    /// Events dropped on full channels
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSinks;
    use chorus_core::Incarnation;
    use tokio::sync::mpsc;

    fn addr(last: u8) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([10, 0, 0, last], 7946))
    }

    fn config() -> Config {
        Config::local("local").with_seed(7)
    }

    fn engine() -> Engine {
        Engine::new(&config(), Member::new("local", addr(1)))
    }

    fn alive(name: &str, last: u8, inc: u64) -> Update {
        Update::new(Member::new(name, addr(last)).with_incarnation(inc), name)
    }

    fn with_peers(names: &[&str]) -> Engine {
        let mut e = engine();
        let now = Instant::now();
        for (i, name) in names.iter().enumerate() {
            e.apply(&alive(name, 10 + i as u8, 0), now);
        }
        e
    }

    #[test]
    fn test_apply_is_idempotent_and_emits_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let config = config().with_events(EventSinks::default().with_join(tx));
        let mut e = Engine::new(&config, Member::new("local", addr(1)));
        let now = Instant::now();

        assert!(e.apply(&alive("a", 2, 0), now));
        assert!(!e.apply(&alive("a", 2, 0), now));

        assert_eq!(rx.try_recv().unwrap().name, "a");
        assert!(rx.try_recv().is_err());
        assert!(e.is_pending("a"));
    }

    #[test]
    fn test_claim_against_local_is_refuted() {
        let mut e = engine();
        let now = Instant::now();
        let claim = Update::new(
            Member::new("local", addr(1))
                .with_status(MemberStatus::Suspect)
                .with_incarnation(3),
            "a",
        );

        assert!(e.apply(&claim, now));
        assert_eq!(e.local().status, MemberStatus::Alive);
        assert_eq!(e.local().incarnation, Incarnation::from(4));
        assert!(e.is_pending("local"));
    }

    #[test]
    fn test_no_refutation_while_leaving() {
        let mut e = engine();
        e.leave();
        let claim = Update::new(
            Member::new("local", addr(1))
                .with_status(MemberStatus::Dead)
                .with_incarnation(5),
            "a",
        );
        assert!(!e.apply(&claim, Instant::now()));
        assert_eq!(e.local().status, MemberStatus::Left);
    }

    #[test]
    fn test_suspect_then_refute_cancels_suspicion() {
        let mut e = with_peers(&["a", "b"]);
        let now = Instant::now();

        assert!(e.suspect("a", now));
        assert!(e.suspicions().get("a").is_some());
        assert_eq!(e.table().get("a").unwrap().status, MemberStatus::Suspect);

        // Alive at the suspected incarnation does not clear it
        assert!(!e.apply(&alive("a", 10, 0), now));
        assert!(e.suspicions().get("a").is_some());

        assert!(e.apply(&alive("a", 10, 1), now));
        assert!(e.suspicions().get("a").is_none());
        assert_eq!(e.table().get("a").unwrap().status, MemberStatus::Alive);
        assert_eq!(e.next_suspicion_deadline(), None);
    }

    #[test]
    fn test_expire_declares_dead_and_emits_leave() {
        let (tx, mut rx) = mpsc::channel(8);
        let config = config().with_events(EventSinks::default().with_leave(tx));
        let mut e = Engine::new(&config, Member::new("local", addr(1)));
        let now = Instant::now();
        e.apply(&alive("a", 2, 0), now);
        e.suspect("a", now);

        let deadline = e.next_suspicion_deadline().unwrap();
        assert!(e.expire(now).is_empty());

        let dead = e.expire(deadline);
        assert_eq!(dead.len(), 1);
        assert_eq!(e.table().get("a").unwrap().status, MemberStatus::Dead);
        assert_eq!(rx.try_recv().unwrap().name, "a");
        assert!(e.suspicions().is_empty());
    }

    #[test]
    fn test_independent_confirmation_is_regossiped() {
        let mut e = with_peers(&["a", "b", "c", "d", "e"]);
        let now = Instant::now();
        let suspect = Member::new("a", addr(10)).with_status(MemberStatus::Suspect);

        assert!(e.apply(&Update::new(suspect.clone(), "b"), now));
        let before = e.next_suspicion_deadline().unwrap();

        // drain the queue so the confirmation is observable
        while e.has_gossip() {
            e.packet(Message::Gossip);
        }
        assert!(e.apply(&Update::new(suspect.clone(), "c"), now));
        assert!(e.is_pending("a"));
        assert!(e.next_suspicion_deadline().unwrap() <= before);

        assert!(!e.apply(&Update::new(suspect, "c"), now));
    }

    #[test]
    fn test_remote_death_softened_to_suspect() {
        let mut e = with_peers(&["a"]);
        let now = Instant::now();
        let remote = vec![
            Member::new("a", addr(10)).with_status(MemberStatus::Dead),
            Member::new("ghost", addr(30)).with_status(MemberStatus::Dead),
        ];

        assert!(e.merge_remote_state(&remote, "b", now));
        assert_eq!(e.table().get("a").unwrap().status, MemberStatus::Suspect);
        assert_eq!(e.table().get("ghost").unwrap().status, MemberStatus::Dead);
    }

    #[test]
    fn test_packet_respects_budget() {
        let mut config = config();
        config.packet_budget = 256;
        let mut e = Engine::new(&config, Member::new("local", addr(1)));
        let now = Instant::now();
        for i in 0..40u8 {
            e.apply(&alive(&format!("member-{i:02}"), i, 0), now);
        }

        let packet = e.packet(Message::Ping { seq: 1, target: "x".into() });
        assert!(!packet.gossip.is_empty());
        assert!(packet.encode().unwrap().len() <= 256);
    }

    #[test]
    fn test_probe_ring_visits_every_peer() {
        let mut e = with_peers(&["a", "b", "c"]);
        let mut seen: Vec<String> = (0..3)
            .filter_map(|_| e.next_probe_target())
            .map(|m| m.name)
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_indirect_relays_exclude_target_and_suspects() {
        let mut e = with_peers(&["a", "b", "c"]);
        let now = Instant::now();
        e.suspect("b", now);

        let relays = e.indirect_relays(5, "a");
        let names: Vec<_> = relays.iter().map(Node::name).collect();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn test_gossip_targets_include_recently_dead() {
        let mut e = with_peers(&["a"]);
        let now = Instant::now();
        e.apply(
            &Update::new(
                Member::new("gone", addr(40)).with_status(MemberStatus::Dead),
                "a",
            ),
            now,
        );
        let targets = e.gossip_targets(5, now, Duration::from_secs(10));
        assert_eq!(targets.len(), 2);

        let later = now + Duration::from_secs(10);
        assert_eq!(e.gossip_targets(5, later, Duration::from_secs(10)).len(), 1);
    }

    #[test]
    fn test_seeded_selection_is_reproducible() {
        let mut a = with_peers(&["a", "b", "c", "d", "e", "f"]);
        let mut b = with_peers(&["a", "b", "c", "d", "e", "f"]);
        let pick = |e: &mut Engine| -> Vec<String> {
            (0..6).filter_map(|_| e.next_probe_target()).map(|m| m.name).collect()
        };
        assert_eq!(pick(&mut a), pick(&mut b));
    }
}
