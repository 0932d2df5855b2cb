//! Log events
//!
//! Every line the engine logs is one of these typed events.

use std::fmt;

use super::logger::Severity;

/// Observable lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Engine
    /// Engine opened over a data directory or in memory
    EngineOpened,
    /// Configuration loaded
    ConfigLoaded,

    // Connections
    /// Connection registered
    ConnectionOpened,
    /// Connection released from the registry
    ConnectionClosed,

    // Open requests
    /// Open request accepted for processing
    OpenRequested,
    /// Open request rejected before any coordination
    OpenRejected,
    /// Open request cancelled by its caller
    OpenAborted,
    /// Open request failed after coordination began
    OpenFailed,
    /// Open request completed with a connection
    StoreOpened,

    // Version change
    /// Notice delivered to an existing connection
    VersionChangeDelivered,
    /// A version-change listener panicked
    ListenerFailed,
    /// Upgrade is waiting on open connections
    UpgradeBlocked,
    /// Upgrade transaction started
    UpgradeBegin,
    /// Upgrade transaction and new version committed
    UpgradeCommitted,
    /// Upgrade transaction rolled back
    UpgradeRolledBack,

    // Faults
    /// Ledger detected a racing commit
    LedgerConflict,
    /// Persisted store image failed verification
    StorageCorruption,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::EngineOpened => "ENGINE_OPENED",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::ConnectionOpened => "CONNECTION_OPENED",
            Event::ConnectionClosed => "CONNECTION_CLOSED",
            Event::OpenRequested => "OPEN_REQUESTED",
            Event::OpenRejected => "OPEN_REJECTED",
            Event::OpenAborted => "OPEN_ABORTED",
            Event::OpenFailed => "OPEN_FAILED",
            Event::StoreOpened => "STORE_OPENED",
            Event::VersionChangeDelivered => "VERSION_CHANGE_DELIVERED",
            Event::ListenerFailed => "LISTENER_FAILED",
            Event::UpgradeBlocked => "UPGRADE_BLOCKED",
            Event::UpgradeBegin => "UPGRADE_BEGIN",
            Event::UpgradeCommitted => "UPGRADE_COMMITTED",
            Event::UpgradeRolledBack => "UPGRADE_ROLLED_BACK",
            Event::LedgerConflict => "LEDGER_CONFLICT",
            Event::StorageCorruption => "STORAGE_CORRUPTION",
        }
    }

    /// Severity this event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::StorageCorruption => Severity::Fatal,
            Event::LedgerConflict => Severity::Error,
            Event::OpenRejected
            | Event::OpenAborted
            | Event::OpenFailed
            | Event::ListenerFailed
            | Event::UpgradeRolledBack => Severity::Warn,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_screaming_snake_case() {
        let events = [
            Event::EngineOpened,
            Event::ConfigLoaded,
            Event::ConnectionOpened,
            Event::ConnectionClosed,
            Event::OpenRequested,
            Event::OpenRejected,
            Event::OpenAborted,
            Event::OpenFailed,
            Event::StoreOpened,
            Event::VersionChangeDelivered,
            Event::ListenerFailed,
            Event::UpgradeBlocked,
            Event::UpgradeBegin,
            Event::UpgradeCommitted,
            Event::UpgradeRolledBack,
            Event::LedgerConflict,
            Event::StorageCorruption,
        ];
        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_severities() {
        assert_eq!(Event::StorageCorruption.severity(), Severity::Fatal);
        assert_eq!(Event::LedgerConflict.severity(), Severity::Error);
        assert_eq!(Event::UpgradeRolledBack.severity(), Severity::Warn);
        assert_eq!(Event::ListenerFailed.severity(), Severity::Warn);
        assert_eq!(Event::UpgradeBlocked.severity(), Severity::Info);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Event::UpgradeBlocked), "UPGRADE_BLOCKED");
    }
}
