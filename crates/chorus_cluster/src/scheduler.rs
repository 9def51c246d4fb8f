//! Background task lifecycle.
//!
//! Each membership handle owns one [`Scheduler`]. Every task it spawns
//! races a shared cancellation token, so [`Scheduler::stop`] drops in-flight
//! work at its next await point and then waits for every task to finish.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug};

/// Owner of a node's background tasks
#[derive(Debug)]
pub struct Scheduler {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl Scheduler {
    /// Create a scheduler with no tasks
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            span: Span::none(),
        }
    }

    /// Run every task inside `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Token cancelled by [`Scheduler::stop`]
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Check if the scheduler was stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `task` until it completes or the scheduler stops
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return;
        }
        let token = self.token.clone();
        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    () = token.cancelled() => debug!(task = name, "task cancelled"),
                    () = task => debug!(task = name, "task finished"),
                }
            }
            .instrument(self.span.clone()),
        );
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Call `tick` every `period`, starting one period from now.
    ///
    /// A zero period disables the task. A tick that overruns delays the
    /// following ones instead of bunching them up.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            debug!(task = name, "periodic task disabled");
            return;
        }
        self.spawn(name, async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
    }

    /// Cancel every task and wait for them to finish. Idempotent.
    pub async fn stop(&self) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
