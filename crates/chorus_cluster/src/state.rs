//! The local member table.
//!
//! Pure data: every method takes the current instant from the caller, and
//! nothing here performs I/O or takes locks. [`Engine`](crate::engine::Engine)
//! serializes access.

use crate::events::{MemberEvent, MemberEventKind};
use chorus_core::{Incarnation, Member, MemberStatus};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// A Dead or Left record kept to stop stale gossip resurrecting it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Last known record
    pub member: Member,
    /// When the member stopped being live
    pub since: Instant,
}

/// Result of [`MemberTable::merge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming record did not supersede what we hold
    Unchanged,
    /// The record was accepted
    Applied {
        /// Status held before, `None` for a first sighting
        previous: Option<MemberStatus>,
        /// Event to emit, if the change is visible to the application
        event: Option<MemberEvent>,
    },
    /// Someone claims a worse state for the local node; it must refute
    Contested {
        /// Incarnation of the contesting claim
        claimed: Incarnation,
    },
}

impl MergeOutcome {
    /// Check if the table changed
    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Take the event to emit
    #[must_use]
    pub fn into_event(self) -> Option<MemberEvent> {
        match self {
            Self::Applied { event, .. } => event,
            _ => None,
        }
    }
}

/// Every record a node knows, keyed by name
#[derive(Debug, Clone)]
pub struct MemberTable {
    local: Member,
    members: BTreeMap<String, Member>,
    tombstones: BTreeMap<String, Tombstone>,
}

impl MemberTable {
    /// Create a table holding only the local node
    #[must_use]
    pub fn new(local: Member) -> Self {
        Self {
            local,
            members: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// The local node's record
    #[must_use]
    pub const fn local(&self) -> &Member {
        &self.local
    }

    /// Look up any record, tombstones included
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Member> {
        if name == self.local.name {
            return Some(&self.local);
        }
        self.members
            .get(name)
            .or_else(|| self.tombstones.get(name).map(|t| &t.member))
    }

    /// Apply a record received from the network.
    ///
    /// The incoming record replaces the held one only if it has a higher
    /// incarnation, or the same incarnation and a worse status. Records
    /// about the local node are never applied; a superseding one is
    /// reported as [`MergeOutcome::Contested`].
    pub fn merge(&mut self, incoming: &Member, now: Instant) -> MergeOutcome {
        if incoming.name == self.local.name {
            if incoming.supersedes(&self.local) {
                return MergeOutcome::Contested {
                    claimed: incoming.incarnation,
                };
            }
            return MergeOutcome::Unchanged;
        }

        let held = self.get(&incoming.name);
        if held.is_some_and(|held| !incoming.supersedes(held)) {
            return MergeOutcome::Unchanged;
        }
        let previous = held.cloned();
        let incoming = incoming.clone();

        let kind = match (previous.as_ref().map(Member::is_live), incoming.is_live()) {
            (None | Some(false), true) => Some(MemberEventKind::Join),
            (Some(true), false) => Some(MemberEventKind::Leave),
            (Some(true), true) => previous
                .as_ref()
                .filter(|p| {
                    p.status != incoming.status || p.addr != incoming.addr || p.meta != incoming.meta
                })
                .map(|_| MemberEventKind::Update),
            (None | Some(false), false) => None,
        };

        if incoming.is_live() {
            self.tombstones.remove(&incoming.name);
            self.members.insert(incoming.name.clone(), incoming.clone());
        } else {
            self.members.remove(&incoming.name);
            let since = match self.tombstones.get(&incoming.name) {
                Some(existing) => existing.since,
                None => now,
            };
            self.tombstones.insert(
                incoming.name.clone(),
                Tombstone {
                    member: incoming.clone(),
                    since,
                },
            );
        }

        MergeOutcome::Applied {
            previous: previous.map(|p| p.status),
            event: kind.map(|kind| MemberEvent::new(kind, incoming)),
        }
    }

    /// Refute a claim against the local node: move past `claimed` and
    /// reassert Alive. Returns the record to broadcast.
    pub fn refute(&mut self, claimed: Incarnation) -> Member {
        self.local.incarnation = self.local.incarnation.refute(claimed);
        self.local.status = MemberStatus::Alive;
        self.local.clone()
    }

    /// Replace the local metadata under a new incarnation
    pub fn update_local_meta(&mut self, meta: Vec<u8>) -> Member {
        self.local.incarnation = self.local.incarnation.next();
        self.local.meta = meta;
        self.local.clone()
    }

    /// Mark the local node as departed
    pub fn mark_local_left(&mut self) -> Member {
        self.local.status = MemberStatus::Left;
        self.local.clone()
    }

    /// Every record, tombstones included, ordered by name
    #[must_use]
    pub fn snapshot(&self) -> Vec<Member> {
        let mut all: Vec<Member> = self
            .members
            .values()
            .chain(self.tombstones.values().map(|t| &t.member))
            .chain(std::iter::once(&self.local))
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Alive and Suspect records, the local node included, ordered by name
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.snapshot().into_iter().filter(Member::is_live).collect()
    }

    /// Live records other than the local node
    pub fn peers(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Number of live records, the local node included
    #[must_use]
    pub fn len_live(&self) -> usize {
        self.members.len() + usize::from(self.local.is_live())
    }

    /// Members declared Dead less than `window` ago
    #[must_use]
    pub fn recently_dead(&self, now: Instant, window: Duration) -> Vec<Member> {
        self.tombstones
            .values()
            .filter(|t| t.member.status == MemberStatus::Dead)
            .filter(|t| now.saturating_duration_since(t.since) < window)
            .map(|t| t.member.clone())
            .collect()
    }

    /// Drop tombstones older than `ttl`, returning the reaped records
    pub fn reap(&mut self, now: Instant, ttl: Duration) -> Vec<Member> {
        let expired: Vec<String> = self
            .tombstones
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.since) >= ttl)
            .map(|(name, _)| name.clone())
            .collect();
        expired
            .iter()
            .filter_map(|name| self.tombstones.remove(name))
            .map(|t| t.member)
            .collect()
    }

    /// Number of tombstones
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(last: u8) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([10, 0, 0, last], 7946))
    }

    fn record(name: &str, status: MemberStatus, inc: u64) -> Member {
        Member::new(name, addr(2))
            .with_status(status)
            .with_incarnation(inc)
    }

    fn table() -> MemberTable {
        MemberTable::new(Member::new("local", addr(1)))
    }

    #[test]
    fn test_new_table_holds_only_local() {
        let t = table();
        assert_eq!(t.len_live(), 1);
        assert_eq!(t.snapshot().len(), 1);
        assert_eq!(t.local().name, "local");
        assert_eq!(t.peers().count(), 0);
    }

    #[test]
    fn test_first_sighting_emits_join() {
        let mut t = table();
        let outcome = t.merge(&record("a", MemberStatus::Alive, 0), Instant::now());
        assert!(outcome.changed());
        let event = outcome.into_event().unwrap();
        assert_eq!(event.kind, MemberEventKind::Join);
        assert_eq!(event.member.name, "a");
        assert_eq!(t.len_live(), 2);
    }

    #[test]
    fn test_first_sighting_of_dead_is_silent_tombstone() {
        let mut t = table();
        let outcome = t.merge(&record("a", MemberStatus::Dead, 3), Instant::now());
        assert!(outcome.changed());
        assert!(outcome.into_event().is_none());
        assert_eq!(t.tombstone_count(), 1);
        assert_eq!(t.len_live(), 1);
    }

    #[test]
    fn test_death_emits_leave_and_revival_emits_join() {
        let mut t = table();
        let now = Instant::now();
        t.merge(&record("a", MemberStatus::Alive, 1), now);

        let dead = t.merge(&record("a", MemberStatus::Dead, 1), now);
        assert_eq!(dead.into_event().unwrap().kind, MemberEventKind::Leave);
        assert_eq!(t.members().len(), 1);

        let alive = t.merge(&record("a", MemberStatus::Alive, 2), now);
        assert_eq!(alive.into_event().unwrap().kind, MemberEventKind::Join);
        assert_eq!(t.tombstone_count(), 0);
    }

    #[test]
    fn test_suspect_emits_update() {
        let mut t = table();
        let now = Instant::now();
        t.merge(&record("a", MemberStatus::Alive, 1), now);
        let outcome = t.merge(&record("a", MemberStatus::Suspect, 1), now);
        assert_eq!(
            outcome,
            MergeOutcome::Applied {
                previous: Some(MemberStatus::Alive),
                event: Some(MemberEvent::new(
                    MemberEventKind::Update,
                    record("a", MemberStatus::Suspect, 1)
                )),
            }
        );
    }

    #[test]
    fn test_bare_incarnation_bump_is_silent() {
        let mut t = table();
        let now = Instant::now();
        t.merge(&record("a", MemberStatus::Alive, 1), now);
        let outcome = t.merge(&record("a", MemberStatus::Alive, 2), now);
        assert!(outcome.changed());
        assert!(outcome.into_event().is_none());
        assert_eq!(t.get("a").unwrap().incarnation, Incarnation::from(2));
    }

    #[test]
    fn test_stale_record_rejected() {
        let mut t = table();
        let now = Instant::now();
        t.merge(&record("a", MemberStatus::Suspect, 4), now);
        assert_eq!(
            t.merge(&record("a", MemberStatus::Alive, 4), now),
            MergeOutcome::Unchanged
        );
        assert_eq!(
            t.merge(&record("a", MemberStatus::Dead, 3), now),
            MergeOutcome::Unchanged
        );
    }

    #[test]
    fn test_claim_against_local_is_contested() {
        let mut t = table();
        let now = Instant::now();
        let outcome = t.merge(&record("local", MemberStatus::Suspect, 0), now);
        assert_eq!(
            outcome,
            MergeOutcome::Contested {
                claimed: Incarnation::zero()
            }
        );
        assert_eq!(t.local().status, MemberStatus::Alive);

        assert_eq!(
            t.merge(&record("local", MemberStatus::Alive, 0), now),
            MergeOutcome::Unchanged
        );
    }

    #[test]
    fn test_refute_moves_past_claim() {
        let mut t = table();
        let refuted = t.refute(Incarnation::from(5));
        assert_eq!(refuted.incarnation, Incarnation::from(6));
        assert_eq!(refuted.status, MemberStatus::Alive);
        assert_eq!(t.local(), &refuted);
    }

    #[test]
    fn test_update_local_meta_bumps_incarnation() {
        let mut t = table();
        let updated = t.update_local_meta(b"v2".to_vec());
        assert_eq!(updated.incarnation, Incarnation::from(1));
        assert_eq!(updated.meta, b"v2");
    }

    #[test]
    fn test_local_left_leaves_live_set() {
        let mut t = table();
        let left = t.mark_local_left();
        assert_eq!(left.status, MemberStatus::Left);
        assert_eq!(t.len_live(), 0);
        assert!(t.members().is_empty());
        assert_eq!(t.snapshot().len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_and_includes_tombstones() {
        let mut t = table();
        let now = Instant::now();
        t.merge(&record("c", MemberStatus::Alive, 0), now);
        t.merge(&record("a", MemberStatus::Dead, 0), now);
        t.merge(&record("b", MemberStatus::Suspect, 0), now);

        let names: Vec<_> = t.snapshot().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b", "c", "local"]);

        let live: Vec<_> = t.members().into_iter().map(|m| m.name).collect();
        assert_eq!(live, vec!["b", "c", "local"]);
    }

    #[test]
    fn test_reap_and_recently_dead() {
        let mut t = table();
        let start = Instant::now();
        t.merge(&record("a", MemberStatus::Dead, 0), start);
        t.merge(&record("b", MemberStatus::Left, 0), start);
        let ttl = Duration::from_secs(30);

        let dead: Vec<_> = t.recently_dead(start, ttl).into_iter().map(|m| m.name).collect();
        assert_eq!(dead, vec!["a"]);
        assert!(t.reap(start + Duration::from_secs(10), ttl).is_empty());

        let later = start + ttl;
        assert!(t.recently_dead(later, ttl).is_empty());
        assert_eq!(t.reap(later, ttl).len(), 2);
        assert_eq!(t.tombstone_count(), 0);
    }

    #[test]
    fn test_tombstone_keeps_original_time() {
        let mut t = table();
        let start = Instant::now();
        t.merge(&record("a", MemberStatus::Dead, 0), start);
        t.merge(
            &record("a", MemberStatus::Dead, 1),
            start + Duration::from_secs(20),
        );
        assert_eq!(t.reap(start + Duration::from_secs(30), Duration::from_secs(30)).len(), 1);
    }

    fn arb_status() -> impl Strategy<Value = MemberStatus> {
        prop_oneof![
            Just(MemberStatus::Alive),
            Just(MemberStatus::Suspect),
            Just(MemberStatus::Dead),
            Just(MemberStatus::Left),
        ]
    }

    fn arb_member() -> impl Strategy<Value = Member> {
        ("[a-c]", arb_status(), 0u64..5)
            .prop_map(|(name, status, inc)| record(&name, status, inc))
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(history in prop::collection::vec(arb_member(), 0..20), m in arb_member()) {
            let mut t = table();
            let now = Instant::now();
            for h in &history {
                t.merge(h, now);
            }
            t.merge(&m, now);
            let before = t.snapshot();
            prop_assert_eq!(t.merge(&m, now), MergeOutcome::Unchanged);
            prop_assert_eq!(t.snapshot(), before);
        }

        #[test]
        fn prop_held_record_never_regresses(records in prop::collection::vec(arb_member(), 1..30)) {
            let mut t = table();
            let now = Instant::now();
            for r in &records {
                let before = t.get(&r.name).cloned();
                t.merge(r, now);
                let after = t.get(&r.name).cloned().unwrap();
                if let Some(before) = before {
                    prop_assert_ne!(before.precedence(&after), std::cmp::Ordering::Greater);
                }
            }
        }

        #[test]
        fn prop_bad_news_not_undone_at_equal_incarnation(
            inc in 0u64..5,
            bad in prop_oneof![Just(MemberStatus::Dead), Just(MemberStatus::Left)],
            other in arb_status(),
        ) {
            let mut t = table();
            let now = Instant::now();
            t.merge(&record("a", bad, inc), now);
            t.merge(&record("a", other, inc), now);
            prop_assert_eq!(t.get("a").unwrap().status, bad);
        }

        #[test]
        fn prop_local_incarnation_strictly_grows_on_refute(claims in prop::collection::vec(0u64..100, 1..20)) {
            let mut t = table();
            for claim in claims {
                let before = t.local().incarnation;
                let after = t.refute(Incarnation::from(claim)).incarnation;
                prop_assert!(after > before);
                prop_assert!(after > Incarnation::from(claim));
            }
        }
    }
}
