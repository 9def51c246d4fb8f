//! Gossip dissemination queue.
//!
//! Every accepted change is queued once per member name and piggybacked on
//! outgoing datagrams a bounded number of times:
//!
//!   retransmits = retransmit_mult * ceil(log10(N + 1))
//!
//! Bad news goes first. Within a priority, the entries sent the fewest
//! times go first, then the newest.

use chorus_core::{Encode, Update};
use std::cmp::Reverse;

/// Transmit budget for a cluster of `cluster_size` live members
#[must_use]
pub fn retransmit_limit(retransmit_mult: u32, cluster_size: usize) -> u32 {
    let scale = ((cluster_size + 1) as f64).log10().ceil().max(1.0);
    (f64::from(retransmit_mult) * scale) as u32
}

#[derive(Debug, Clone)]
struct Entry {
    update: Update,
    priority: u8,
    remaining: u32,
    sent: u32,
    id: u64,
}

/// Bounded queue of pending membership updates
#[derive(Debug)]
pub struct BroadcastQueue {
    entries: Vec<Entry>,
    next_id: u64,
    retransmit_mult: u32,
    capacity: usize,
    evicted: u64,
}

impl BroadcastQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(retransmit_mult: u32, capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            retransmit_mult,
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Queue an update, replacing any pending one about the same member.
    ///
    /// When the queue is full the oldest lowest-priority entry is evicted.
    pub fn enqueue(&mut self, update: Update, cluster_size: usize) {
        self.entries.retain(|e| e.update.member.name != update.member.name);

        let entry = Entry {
            priority: update.member.status.rank(),
            remaining: retransmit_limit(self.retransmit_mult, cluster_size),
            sent: 0,
            id: self.next_id,
            update,
        };
        self.next_id += 1;
        self.entries.push(entry);

        if self.entries.len() > self.capacity {
            if let Some(victim) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.priority, e.id))
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(victim);
                self.evicted += 1;
            }
        }
    }

    /// Select updates whose encodings fit in `max_bytes`.
    ///
    /// Each selected entry spends one transmit; spent entries leave the
    /// queue.
    pub fn piggyback(&mut self, max_bytes: usize) -> Vec<Update> {
        self.entries
            .sort_by_key(|e| (Reverse(e.priority), e.sent, Reverse(e.id)));

        let mut used = 0;
        let mut selected = Vec::new();
        for entry in &mut self.entries {
            let len = entry.update.encoded_len();
            if used + len > max_bytes {
                continue;
            }
            used += len;
            entry.remaining = entry.remaining.saturating_sub(1);
            entry.sent += 1;
            selected.push(entry.update.clone());
        }
        self.entries.retain(|e| e.remaining > 0);
        selected
    }

    /// Check if an update about `name` is pending
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.update.member.name == name)
    }

    /// Number of pending updates
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped because the queue was full
    #[must_use]
    pub const fn evicted(&self) -> u64 {
        self.evicted
    }
}
