//! Protocol counters
//!
//! Counters only, monotonic, reset on process start. Relaxed atomics: the
//! counters describe what happened and never gate behavior.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for the open/upgrade protocol.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    opens_succeeded: AtomicU64,
    opens_failed: AtomicU64,
    upgrades_committed: AtomicU64,
    upgrades_rolled_back: AtomicU64,
    blocked_events: AtomicU64,
    notices_delivered: AtomicU64,
    cancellations: AtomicU64,
}

impl MetricsRegistry {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// An open request produced a connection
    pub fn increment_opens_succeeded(&self) {
        self.opens_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// An open request failed, for any reason
    pub fn increment_opens_failed(&self) {
        self.opens_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// An upgrade transaction committed
    pub fn increment_upgrades_committed(&self) {
        self.upgrades_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// An upgrade transaction rolled back
    pub fn increment_upgrades_rolled_back(&self) {
        self.upgrades_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// A request emitted its Blocked event
    pub fn increment_blocked_events(&self) {
        self.blocked_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Version-change notices delivered to connections
    pub fn add_notices_delivered(&self, count: u64) {
        self.notices_delivered.fetch_add(count, Ordering::Relaxed);
    }

    /// A request was cancelled by its caller
    pub fn increment_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            opens_succeeded: self.opens_succeeded.load(Ordering::Relaxed),
            opens_failed: self.opens_failed.load(Ordering::Relaxed),
            upgrades_committed: self.upgrades_committed.load(Ordering::Relaxed),
            upgrades_rolled_back: self.upgrades_rolled_back.load(Ordering::Relaxed),
            blocked_events: self.blocked_events.load(Ordering::Relaxed),
            notices_delivered: self.notices_delivered.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// Serializable counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub opens_succeeded: u64,
    pub opens_failed: u64,
    pub upgrades_committed: u64,
    pub upgrades_rolled_back: u64,
    pub blocked_events: u64,
    pub notices_delivered: u64,
    pub cancellations: u64,
}
