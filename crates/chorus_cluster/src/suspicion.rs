//! Suspicion tracking.
//!
//! A suspicion exists only while a member is Suspect. Its deadline starts at
//! the policy's maximum timeout and shrinks as independent witnesses confirm
//! the suspicion, so well-corroborated failures are declared sooner.

use chorus_core::Incarnation;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::Config;

/// Policy mapping corroboration to a suspicion timeout.
///
/// Implementations must not grow the timeout as `confirmations` increases.
pub trait SuspicionTimeout: std::fmt::Debug + Send + Sync {
    /// Time from the start of suspicion until the member is declared dead
    fn timeout(&self, confirmations: usize, cluster_size: usize) -> Duration;
}

/// Logarithmic decay from `max` to `min` as confirmations approach the
/// expected count `k`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogScaledTimeout {
    /// Minimum timeout multiplier
    pub suspicion_mult: u32,
    /// Maximum timeout as a multiple of the minimum
    pub max_timeout_mult: u32,
    /// Probe interval the timeouts are scaled from
    pub probe_interval: Duration,
}

impl LogScaledTimeout {
    /// Build from node configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            suspicion_mult: config.suspicion_mult,
            max_timeout_mult: config.suspicion_max_timeout_mult,
            probe_interval: config.probe_interval,
        }
    }

    /// Timeout once `k` confirmations arrived
    #[must_use]
    pub fn min_timeout(&self, cluster_size: usize) -> Duration {
        let scale = (cluster_size.max(1) as f64).log10().max(1.0);
        self.probe_interval
            .mul_f64(f64::from(self.suspicion_mult) * scale)
    }

    /// Timeout with no confirmations
    #[must_use]
    pub fn max_timeout(&self, cluster_size: usize) -> Duration {
        self.min_timeout(cluster_size) * self.max_timeout_mult.max(1)
    }

    /// Confirmations needed to reach the minimum timeout.
    ///
    /// Zero when the cluster is too small to supply them.
    #[must_use]
    pub fn expected_confirmations(&self, cluster_size: usize) -> usize {
        let k = self.suspicion_mult.saturating_sub(2) as usize;
        if cluster_size.saturating_sub(2) < k { 0 } else { k }
    }
}

impl SuspicionTimeout for LogScaledTimeout {
    fn timeout(&self, confirmations: usize, cluster_size: usize) -> Duration {
        let min = self.min_timeout(cluster_size);
        let k = self.expected_confirmations(cluster_size);
        if k == 0 || confirmations >= k {
            return min;
        }

        let max = self.max_timeout(cluster_size);
        let frac = ((confirmations + 1) as f64).ln() / ((k + 1) as f64).ln();
        let shrink = (max - min).mul_f64(frac);
        max.saturating_sub(shrink).max(min)
    }
}

/// An open suspicion about one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspicion {
    /// Suspected member
    pub name: String,
    /// Incarnation the suspicion refers to
    pub incarnation: Incarnation,
    /// Node that raised the suspicion
    pub suspector: String,
    confirmations: BTreeSet<String>,
    started: Instant,
    deadline: Instant,
}

impl Suspicion {
    /// Independent confirmations beyond the original suspector
    #[must_use]
    pub fn confirmations(&self) -> usize {
        self.confirmations.len()
    }

    /// When the member will be declared dead
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// When the suspicion started
    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }
}

/// All open suspicions of a node
#[derive(Debug)]
pub struct SuspicionTable {
    entries: BTreeMap<String, Suspicion>,
    policy: Arc<dyn SuspicionTimeout>,
}

impl SuspicionTable {
    /// Create an empty table
    #[must_use]
    pub fn new(policy: Arc<dyn SuspicionTimeout>) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
        }
    }

    /// Open a suspicion.
    ///
    /// Returns false if one for the same or a newer incarnation is already
    /// open.
    pub fn start(
        &mut self,
        name: &str,
        incarnation: Incarnation,
        suspector: &str,
        now: Instant,
        cluster_size: usize,
    ) -> bool {
        if let Some(existing) = self.entries.get(name) {
            if existing.incarnation >= incarnation {
                return false;
            }
        }
        let deadline = now + self.policy.timeout(0, cluster_size);
        self.entries.insert(
            name.to_string(),
            Suspicion {
                name: name.to_string(),
                incarnation,
                suspector: suspector.to_string(),
                confirmations: BTreeSet::new(),
                started: now,
                deadline,
            },
        );
        true
    }

    /// Record an independent confirmation.
    ///
    /// Returns true if `witness` is new for this suspicion; the deadline is
    /// then recomputed and never moves later.
    pub fn confirm(
        &mut self,
        name: &str,
        incarnation: Incarnation,
        witness: &str,
        cluster_size: usize,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        if entry.incarnation != incarnation || entry.suspector == witness {
            return false;
        }
        if !entry.confirmations.insert(witness.to_string()) {
            return false;
        }
        let timeout = self.policy.timeout(entry.confirmations.len(), cluster_size);
        entry.deadline = entry.deadline.min(entry.started + timeout);
        true
    }

    /// Close a suspicion
    pub fn remove(&mut self, name: &str) -> Option<Suspicion> {
        self.entries.remove(name)
    }

    /// Remove and return every suspicion whose deadline has passed
    pub fn take_expired(&mut self, now: Instant) -> Vec<Suspicion> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|s| s.deadline <= now)
            .map(|s| s.name.clone())
            .collect();
        expired
            .iter()
            .filter_map(|name| self.entries.remove(name))
            .collect()
    }

    /// Earliest open deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|s| s.deadline).min()
    }

    /// Look up a suspicion
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Suspicion> {
        self.entries.get(name)
    }

    /// Number of open suspicions
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no suspicion is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LogScaledTimeout {
        LogScaledTimeout {
            suspicion_mult: 4,
            max_timeout_mult: 6,
            probe_interval: Duration::from_secs(1),
        }
    }

    fn table() -> SuspicionTable {
        SuspicionTable::new(Arc::new(policy()))
    }

    #[test]
    fn test_min_timeout_scales_with_cluster() {
        let p = policy();
        assert_eq!(p.min_timeout(1), Duration::from_secs(4));
        assert_eq!(p.min_timeout(10), Duration::from_secs(4));
        assert_eq!(p.min_timeout(100), Duration::from_secs(8));
    }

    #[test]
    fn test_small_cluster_expects_no_confirmations() {
        let p = policy();
        assert_eq!(p.expected_confirmations(3), 0);
        assert_eq!(p.expected_confirmations(4), 2);
        assert_eq!(p.timeout(0, 3), p.min_timeout(3));
    }

    #[test]
    fn test_more_confirmations_never_longer() {
        let p = policy();
        let n = 50;
        let mut last = p.timeout(0, n);
        assert_eq!(last, p.max_timeout(n));
        for c in 1..6 {
            let t = p.timeout(c, n);
            assert!(t <= last, "timeout grew at {c} confirmations");
            last = t;
        }
        assert_eq!(last, p.min_timeout(n));
    }

    #[test]
    fn test_start_rejects_stale_incarnation() {
        let mut t = table();
        let now = Instant::now();
        assert!(t.start("a", Incarnation::from(2), "x", now, 10));
        assert!(!t.start("a", Incarnation::from(2), "y", now, 10));
        assert!(!t.start("a", Incarnation::from(1), "y", now, 10));
        assert!(t.start("a", Incarnation::from(3), "y", now, 10));
        assert_eq!(t.get("a").unwrap().suspector, "y");
    }

    #[test]
    fn test_confirm_counts_independent_witnesses_once() {
        let mut t = table();
        let now = Instant::now();
        t.start("a", Incarnation::from(1), "x", now, 10);
        let initial = t.get("a").unwrap().deadline();

        assert!(!t.confirm("a", Incarnation::from(1), "x", 10));
        assert!(t.confirm("a", Incarnation::from(1), "y", 10));
        assert!(!t.confirm("a", Incarnation::from(1), "y", 10));
        assert!(!t.confirm("a", Incarnation::from(0), "z", 10));

        let s = t.get("a").unwrap();
        assert_eq!(s.confirmations(), 1);
        assert!(s.deadline() < initial);
    }

    #[test]
    fn test_take_expired() {
        let mut t = table();
        let now = Instant::now();
        t.start("a", Incarnation::from(1), "x", now, 10);
        t.start("b", Incarnation::from(1), "x", now + Duration::from_secs(5), 10);

        assert!(t.take_expired(now).is_empty());
        let deadline_a = t.get("a").unwrap().deadline();
        assert_eq!(t.next_deadline(), Some(deadline_a));

        let expired = t.take_expired(deadline_a);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "a");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_remove_closes_suspicion() {
        let mut t = table();
        t.start("a", Incarnation::from(1), "x", Instant::now(), 10);
        assert!(t.remove("a").is_some());
        assert!(t.is_empty());
        assert_eq!(t.next_deadline(), None);
    }
}
