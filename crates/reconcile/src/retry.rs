//! Backoff policy and per-call retry bookkeeping.

use std::time::Duration;

/// Fixed delay used while a resource is locked and while waiting for idle.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// Backoff settings shared by the reconciler and the task tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts while a resource is locked.
    pub lock_delay: Duration,
    /// Maximum number of lock waits for one entity. `None` waits forever,
    /// which is what the server-side lock semantics expect.
    pub max_lock_waits: Option<u32>,
    /// Delay between polls of the running task list.
    pub idle_poll: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            lock_delay: DEFAULT_DELAY,
            max_lock_waits: None,
            idle_poll: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Cap the number of lock waits.
    pub fn with_max_lock_waits(mut self, max: u32) -> Self {
        self.max_lock_waits = Some(max);
        self
    }

    /// Whether another lock wait is allowed after `waits` waits.
    pub fn allows_lock_wait(&self, waits: u32) -> bool {
        self.max_lock_waits.is_none_or(|max| waits < max)
    }
}

/// Failure classes recorded while reconciling one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Conflict,
    Locked,
    LockedPaused,
    SoftTimeout,
    Http(u16),
}

/// Retry bookkeeping for one reconciliation, returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Mutations issued (create or update).
    pub attempts: u32,
    /// Backoff sleeps taken because of a lock.
    pub lock_waits: u32,
    pub last_failure: Option<FailureKind>,
    /// Task holding the lock during the last locked attempt.
    pub blocking_task: Option<String>,
}

impl RetryState {
    pub fn record(&mut self, failure: FailureKind) {
        self.last_failure = Some(failure);
    }
}
