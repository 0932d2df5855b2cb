//! Connection handles
//!
//! A `Connection` is the caller's handle to one store, bound for life to the
//! version it was opened at. Closing goes through the registry; dropping a
//! connection closes it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::RegistryResult;
use super::ConnectionRegistry;
use crate::storage::{StorageEngine, TransactionMode, TransactionScope};
use crate::transaction::{Transaction, TransactionResult};

/// Opaque, process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Open and accepting transactions
    Active,
    /// Close requested; waiting for in-flight transactions
    ClosePending,
    /// Released from the registry
    Closed,
}

impl ConnectionState {
    /// State name for observability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::ClosePending => "ClosePending",
            Self::Closed => "Closed",
        }
    }
}

/// Delivered to Active connections when a higher version is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChangeNotice {
    /// The store's version when the request started
    pub old_version: u64,
    /// The requested version
    pub new_version: u64,
}

impl VersionChangeNotice {
    /// Create a notice.
    pub fn new(old_version: u64, new_version: u64) -> Self {
        Self {
            old_version,
            new_version,
        }
    }
}

/// Version-change listener. Runs to completion before the next event is
/// dispatched; the control handle lets it close its connection synchronously.
pub type VersionChangeListener =
    Arc<dyn Fn(&VersionChangeNotice, &ConnectionControl) + Send + Sync>;

/// Non-owning control over a registered connection.
#[derive(Clone)]
pub struct ConnectionControl {
    id: ConnectionId,
    store: Arc<str>,
    bound_version: u64,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionControl {
    pub(crate) fn new(
        id: ConnectionId,
        store: &str,
        bound_version: u64,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            id,
            store: Arc::from(store),
            bound_version,
            registry,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Store name.
    pub fn store(&self) -> &str {
        &self.store
    }

    /// The version the connection was opened at.
    pub fn bound_version(&self) -> u64 {
        self.bound_version
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.registry
            .state(self.id)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) -> ConnectionState {
        self.registry
            .close(self.id)
            .unwrap_or(ConnectionState::Closed)
    }

    pub(crate) fn begin_transaction(&self) -> RegistryResult<()> {
        self.registry.begin_transaction(self.id)
    }

    pub(crate) fn finish_transaction(&self) {
        let _ = self.registry.finish_transaction(self.id);
    }
}

impl fmt::Debug for ConnectionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionControl")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("bound_version", &self.bound_version)
            .finish()
    }
}

/// An open handle to a store, bound to one version.
pub struct Connection {
    control: ConnectionControl,
    engine: Arc<dyn StorageEngine>,
}

impl Connection {
    pub(crate) fn new(control: ConnectionControl, engine: Arc<dyn StorageEngine>) -> Self {
        Self { control, engine }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.control.id
    }

    /// Store name.
    pub fn name(&self) -> &str {
        self.control.store()
    }

    /// The version this connection was opened at. Never changes.
    pub fn version(&self) -> u64 {
        self.control.bound_version
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.control.state()
    }

    /// Control handle, usable from listeners and other tasks.
    pub fn control(&self) -> ConnectionControl {
        self.control.clone()
    }

    /// Register a version-change listener. Fails once the connection is closing.
    pub fn on_version_change<F>(&self, listener: F) -> RegistryResult<()>
    where
        F: Fn(&VersionChangeNotice, &ConnectionControl) + Send + Sync + 'static,
    {
        self.control
            .registry
            .add_listener(self.control.id, Arc::new(listener))
    }

    /// Begin a transaction against this connection's bound version.
    ///
    /// Version-change transactions are reserved for upgrades.
    pub fn transaction(&self, mode: TransactionMode) -> TransactionResult<Transaction> {
        let mode = match mode {
            TransactionMode::VersionChange => TransactionMode::ReadWrite,
            other => other,
        };
        self.control.begin_transaction()?;
        let handle = match self.engine.begin_transaction_at(
            TransactionScope::new(self.name(), mode),
            self.version(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.control.finish_transaction();
                return Err(e.into());
            }
        };
        Ok(Transaction::for_connection(
            Arc::clone(&self.engine),
            handle,
            self.control.clone(),
        ))
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) -> ConnectionState {
        self.control.close()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.control.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.control.id)
            .field("store", &self.control.store)
            .field("bound_version", &self.control.bound_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Telemetry;
    use crate::storage::MemoryEngine;
    use serde_json::json;
    use std::sync::Mutex;

    fn open(registry: &Arc<ConnectionRegistry>, engine: &Arc<MemoryEngine>, version: u64) -> Connection {
        let id = ConnectionId::new();
        registry.register("db", id, version).unwrap();
        Connection::new(
            ConnectionControl::new(id, "db", version, Arc::clone(registry)),
            engine.clone(),
        )
    }

    fn setup() -> (Arc<ConnectionRegistry>, Arc<MemoryEngine>) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(Telemetry::silent())));
        let engine = Arc::new(MemoryEngine::new());
        let mut tx = engine
            .begin_transaction(TransactionScope::new("db", TransactionMode::VersionChange))
            .unwrap();
        tx.stage_version(1).unwrap();
        engine.commit(tx).unwrap();
        (registry, engine)
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_drop_closes_connection() {
        let (registry, engine) = setup();
        let conn = open(&registry, &engine, 1);
        let control = conn.control();
        assert_eq!(control.state(), ConnectionState::Active);

        drop(conn);
        assert_eq!(control.state(), ConnectionState::Closed);
        assert!(registry.list_open("db").unwrap().is_empty());
    }

    #[test]
    fn test_close_waits_for_transaction() {
        let (registry, engine) = setup();
        let conn = open(&registry, &engine, 1);

        let mut tx = conn.transaction(TransactionMode::ReadWrite).unwrap();
        tx.put("k", json!("v")).unwrap();
        assert_eq!(conn.close(), ConnectionState::ClosePending);
        assert!(conn.transaction(TransactionMode::ReadOnly).is_err());

        tx.commit().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(engine.read_committed("db", "k").unwrap(), Some(json!("v")));
    }

    #[test]
    fn test_listener_can_close_through_control() {
        let (registry, engine) = setup();
        let conn = open(&registry, &engine, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.on_version_change(move |notice, control| {
            sink.lock().unwrap().push(*notice);
            control.close();
        })
        .unwrap();

        let notice = VersionChangeNotice::new(1, 2);
        for listener in registry.listeners(conn.id()).unwrap() {
            listener(&notice, &conn.control());
        }

        assert_eq!(seen.lock().unwrap().as_slice(), &[notice]);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.version(), 1);
    }

    #[test]
    fn test_control_reports_bound_version() {
        let (registry, engine) = setup();
        let conn = open(&registry, &engine, 1);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        conn.on_version_change(move |notice, control| {
            *sink.lock().unwrap() = Some((control.bound_version(), notice.new_version));
        })
        .unwrap();

        let control = conn.control();
        assert_eq!(control.bound_version(), 1);
        for listener in registry.listeners(conn.id()).unwrap() {
            listener(&VersionChangeNotice::new(1, 3), &control);
        }
        assert_eq!(*seen.lock().unwrap(), Some((1, 3)));
    }

    #[test]
    fn test_version_change_mode_is_downgraded_to_read_write() {
        let (registry, engine) = setup();
        let conn = open(&registry, &engine, 1);
        let tx = conn.transaction(TransactionMode::VersionChange).unwrap();
        assert_eq!(tx.mode(), TransactionMode::ReadWrite);
    }
}
