//! Membership notifications.
//!
//! Delivery is lossy: events are pushed with `try_send`, and an event whose
//! channel is full or closed is dropped and counted. The protocol never
//! waits on a subscriber. Callers that need every transition should size
//! their channels generously and reconcile against
//! [`Membership::members`](crate::Membership::members).

use chorus_core::Member;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Kind of membership transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberEventKind {
    /// A member became live
    Join,
    /// A live member changed status, address, or metadata
    Update,
    /// A member was declared Dead or Left
    Leave,
}

impl MemberEventKind {
    /// Short lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Update => "update",
            Self::Leave => "leave",
        }
    }
}

/// A membership transition and the record it produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    /// Transition kind
    pub kind: MemberEventKind,
    /// Record after the transition
    pub member: Member,
}

impl MemberEvent {
    /// Create an event
    #[must_use]
    pub fn new(kind: MemberEventKind, member: Member) -> Self {
        Self { kind, member }
    }
}

/// Application channels, one per event kind; `None` discards that kind
#[derive(Debug, Clone, Default)]
pub struct EventSinks {
    /// Receives members that joined
    pub join: Option<mpsc::Sender<Member>>,
    /// Receives members that died or left
    pub leave: Option<mpsc::Sender<Member>>,
    /// Receives other updates
    pub update: Option<mpsc::Sender<Member>>,
}

impl EventSinks {
    /// Set join channel
    #[must_use]
    pub fn with_join(mut self, tx: mpsc::Sender<Member>) -> Self {
        self.join = Some(tx);
        self
    }

    /// Set leave channel
    #[must_use]
    pub fn with_leave(mut self, tx: mpsc::Sender<Member>) -> Self {
        self.leave = Some(tx);
        self
    }

    /// Set update channel
    #[must_use]
    pub fn with_update(mut self, tx: mpsc::Sender<Member>) -> Self {
        self.update = Some(tx);
        self
    }

    fn sink(&self, kind: MemberEventKind) -> Option<&mpsc::Sender<Member>> {
        match kind {
            MemberEventKind::Join => self.join.as_ref(),
            MemberEventKind::Update => self.update.as_ref(),
            MemberEventKind::Leave => self.leave.as_ref(),
        }
    }
}

/// Emits events to the application sinks
#[derive(Debug, Default)]
pub struct EventBus {
    sinks: EventSinks,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus over `sinks`
    #[must_use]
    pub fn new(sinks: EventSinks) -> Self {
        Self {
            sinks,
            dropped: AtomicU64::new(0),
        }
    }

    /// Deliver an event without blocking.
    ///
    /// Called while the state that produced the event is still locked, so
    /// events reach each channel in mutation order.
    pub fn emit(&self, event: MemberEvent) {
        let Some(tx) = self.sinks.sink(event.kind) else {
            return;
        };
        match tx.try_send(event.member) {
            Ok(()) => {}
            Err(TrySendError::Full(member)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = event.kind.as_str(),
                    member = %member.name,
                    "event channel full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events dropped because a channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
