//! Protocol event trace
//!
//! Records every protocol event with a global sequence number so ordering
//! can be checked after the fact. The trace describes what happened; it
//! never decides what happens, and a poisoned trace is silently skipped.
//!
//! The trace keeps at most `capacity` records. Once full, the oldest record
//! is evicted for each new one; sequence numbers keep counting, so a gap
//! at the front shows how much was evicted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::OpenErrorKind;
use crate::registry::ConnectionId;

/// One protocol event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// A version-change notice reached an existing connection
    NoticeDelivered {
        store: String,
        connection: ConnectionId,
        old_version: u64,
        new_version: u64,
    },
    /// A request was blocked by open connections
    Blocked {
        store: String,
        old_version: u64,
        new_version: u64,
    },
    /// An upgrade transaction started
    UpgradeBegin {
        store: String,
        old_version: u64,
        new_version: u64,
    },
    /// An upgrade transaction committed with its new version
    UpgradeCommitted {
        store: String,
        old_version: u64,
        new_version: u64,
    },
    /// An upgrade transaction rolled back
    UpgradeRolledBack {
        store: String,
        old_version: u64,
        new_version: u64,
    },
    /// A request produced a connection
    Opened {
        store: String,
        connection: ConnectionId,
        version: u64,
    },
    /// A request failed
    Failed { store: String, kind: OpenErrorKind },
}

impl TraceEvent {
    /// Store the event belongs to.
    pub fn store(&self) -> &str {
        match self {
            Self::NoticeDelivered { store, .. }
            | Self::Blocked { store, .. }
            | Self::UpgradeBegin { store, .. }
            | Self::UpgradeCommitted { store, .. }
            | Self::UpgradeRolledBack { store, .. }
            | Self::Opened { store, .. }
            | Self::Failed { store, .. } => store,
        }
    }

    /// Event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::NoticeDelivered { .. } => "notice_delivered",
            Self::Blocked { .. } => "blocked",
            Self::UpgradeBegin { .. } => "upgrade_begin",
            Self::UpgradeCommitted { .. } => "upgrade_committed",
            Self::UpgradeRolledBack { .. } => "upgrade_rolled_back",
            Self::Opened { .. } => "opened",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// Records kept by a trace built with [`EventTrace::new`].
pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

/// Bounded, ordered record of protocol events.
#[derive(Debug)]
pub struct EventTrace {
    capacity: usize,
    next_sequence: AtomicU64,
    records: Mutex<VecDeque<TraceRecord>>,
}

impl Default for EventTrace {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACE_CAPACITY)
    }
}

impl EventTrace {
    /// Create an empty trace holding [`DEFAULT_TRACE_CAPACITY`] records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty trace holding at most `capacity` records.
    ///
    /// A capacity of 0 disables recording.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            next_sequence: AtomicU64::new(0),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_TRACE_CAPACITY))),
        }
    }

    /// Maximum number of records kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an event, evicting the oldest record when full.
    pub fn record(&self, event: TraceEvent) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut records) = self.records.lock() {
            // Sequence is assigned under the lock so it matches append order.
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(TraceRecord {
                sequence,
                recorded_at: Utc::now(),
                event,
            });
        }
    }

    /// All records, in order.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Events of one store, in order.
    pub fn events_for(&self, store: &str) -> Vec<TraceEvent> {
        self.records
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.event.store() == store)
                    .map(|r| r.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records.
    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}
