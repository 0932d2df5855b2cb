//! Connection registry
//!
//! Tracks every live connection per store name: its bound version, its
//! lifecycle state and its version-change listeners. The registry holds a
//! non-owning view; the `Connection` handle belongs to the caller.
//!
//! Layout is an arena keyed by store name. Each store has its own slot with
//! its own lock, so registry traffic on one store never blocks another.
//! Every mutation of a slot bumps that store's change generation, published
//! on a `watch` channel; waiters subscribe before they inspect state so a
//! close can never slip between the check and the wait.
//!
//! Lifecycle per connection:
//!
//! ```text
//! Active ──close()──▶ ClosePending ──last transaction done──▶ Closed
//!    └──────────────close() with nothing in flight───────────────┘
//! ```

mod connection;
mod errors;

pub use connection::{
    Connection, ConnectionControl, ConnectionId, ConnectionState, VersionChangeListener,
    VersionChangeNotice,
};
pub use errors::{RegistryError, RegistryErrorKind, RegistryResult};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;

use crate::observability::{Event, Telemetry};

/// Point-in-time view of one registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Connection id
    pub id: ConnectionId,
    /// Version the connection was opened at
    pub bound_version: u64,
    /// Lifecycle state at snapshot time
    pub state: ConnectionState,
}

struct ConnectionEntry {
    id: ConnectionId,
    bound_version: u64,
    state: ConnectionState,
    in_flight: usize,
    listeners: Vec<VersionChangeListener>,
}

impl ConnectionEntry {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            bound_version: self.bound_version,
            state: self.state,
        }
    }
}

struct StoreSlot {
    connections: Mutex<Vec<ConnectionEntry>>,
    changes: watch::Sender<u64>,
}

impl StoreSlot {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            connections: Mutex::new(Vec::new()),
            changes,
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

/// Registry of live connections, keyed by store name.
pub struct ConnectionRegistry {
    stores: RwLock<HashMap<String, Arc<StoreSlot>>>,
    owners: RwLock<HashMap<ConnectionId, String>>,
    telemetry: Arc<Telemetry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            telemetry,
        }
    }

    fn slot(&self, name: &str) -> RegistryResult<Option<Arc<StoreSlot>>> {
        let stores = self.stores.read().map_err(|_| RegistryError::unavailable())?;
        Ok(stores.get(name).cloned())
    }

    fn slot_or_create(&self, name: &str) -> RegistryResult<Arc<StoreSlot>> {
        if let Some(slot) = self.slot(name)? {
            return Ok(slot);
        }
        let mut stores = self.stores.write().map_err(|_| RegistryError::unavailable())?;
        Ok(stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(StoreSlot::new()))
            .clone())
    }

    fn owner_slot(&self, id: ConnectionId) -> RegistryResult<Option<(String, Arc<StoreSlot>)>> {
        let name = {
            let owners = self.owners.read().map_err(|_| RegistryError::unavailable())?;
            match owners.get(&id) {
                Some(name) => name.clone(),
                None => return Ok(None),
            }
        };
        Ok(self.slot(&name)?.map(|slot| (name, slot)))
    }

    fn with_entry<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Vec<ConnectionEntry>, usize) -> T,
    ) -> RegistryResult<Option<(String, Arc<StoreSlot>, T)>> {
        let Some((name, slot)) = self.owner_slot(id)? else {
            return Ok(None);
        };
        let result = {
            let mut connections = slot
                .connections
                .lock()
                .map_err(|_| RegistryError::unavailable())?;
            match connections.iter().position(|entry| entry.id == id) {
                Some(index) => f(&mut connections, index),
                None => return Ok(None),
            }
        };
        Ok(Some((name, slot, result)))
    }

    fn forget_owner(&self, id: ConnectionId) -> RegistryResult<()> {
        let mut owners = self.owners.write().map_err(|_| RegistryError::unavailable())?;
        owners.remove(&id);
        Ok(())
    }

    /// Register a new Active connection bound to `bound_version`.
    pub fn register(&self, name: &str, id: ConnectionId, bound_version: u64) -> RegistryResult<()> {
        let slot = self.slot_or_create(name)?;
        {
            let mut owners = self.owners.write().map_err(|_| RegistryError::unavailable())?;
            owners.insert(id, name.to_string());
        }
        {
            let mut connections = slot
                .connections
                .lock()
                .map_err(|_| RegistryError::unavailable())?;
            connections.push(ConnectionEntry {
                id,
                bound_version,
                state: ConnectionState::Active,
                in_flight: 0,
                listeners: Vec::new(),
            });
        }
        slot.bump();

        let version = bound_version.to_string();
        let id = id.to_string();
        self.telemetry.emit(
            Event::ConnectionOpened,
            &[("store", name), ("connection", &id), ("version", &version)],
        );
        Ok(())
    }

    /// Remove a connection. Returns false if it was not registered.
    pub fn unregister(&self, name: &str, id: ConnectionId) -> RegistryResult<bool> {
        let Some(slot) = self.slot(name)? else {
            return Ok(false);
        };
        let removed = {
            let mut connections = slot
                .connections
                .lock()
                .map_err(|_| RegistryError::unavailable())?;
            let before = connections.len();
            connections.retain(|entry| entry.id != id);
            connections.len() != before
        };
        if removed {
            self.forget_owner(id)?;
            slot.bump();
            let id = id.to_string();
            self.telemetry
                .emit(Event::ConnectionClosed, &[("store", name), ("connection", &id)]);
        }
        Ok(removed)
    }

    /// Active connections of a store, in registration order.
    pub fn list_active(&self, name: &str) -> RegistryResult<Vec<ConnectionSnapshot>> {
        self.list_where(name, |entry| entry.state == ConnectionState::Active)
    }

    /// Connections of a store that are not yet closed (Active or ClosePending).
    pub fn list_open(&self, name: &str) -> RegistryResult<Vec<ConnectionSnapshot>> {
        self.list_where(name, |entry| entry.state != ConnectionState::Closed)
    }

    /// Open connections bound below `version`.
    pub fn open_below(&self, name: &str, version: u64) -> RegistryResult<Vec<ConnectionSnapshot>> {
        self.list_where(name, |entry| {
            entry.state != ConnectionState::Closed && entry.bound_version < version
        })
    }

    fn list_where(
        &self,
        name: &str,
        keep: impl Fn(&ConnectionEntry) -> bool,
    ) -> RegistryResult<Vec<ConnectionSnapshot>> {
        let Some(slot) = self.slot(name)? else {
            return Ok(Vec::new());
        };
        let connections = slot
            .connections
            .lock()
            .map_err(|_| RegistryError::unavailable())?;
        Ok(connections
            .iter()
            .filter(|entry| keep(entry))
            .map(ConnectionEntry::snapshot)
            .collect())
    }

    /// Mark a connection ClosePending. Returns false if it was not Active.
    pub fn mark_closing(&self, id: ConnectionId) -> RegistryResult<bool> {
        let marked = self.with_entry(id, |connections, index| {
            let entry = &mut connections[index];
            if entry.state == ConnectionState::Active {
                entry.state = ConnectionState::ClosePending;
                true
            } else {
                false
            }
        })?;
        match marked {
            Some((_, slot, true)) => {
                slot.bump();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Close a connection: mark it closing, and release it at once if it
    /// has no transaction in flight. Returns the resulting state.
    pub fn close(&self, id: ConnectionId) -> RegistryResult<ConnectionState> {
        self.mark_closing(id)?;
        self.release_if_idle(id)
    }

    fn release_if_idle(&self, id: ConnectionId) -> RegistryResult<ConnectionState> {
        let idle = self.with_entry(id, |connections, index| {
            let entry = &connections[index];
            entry.state == ConnectionState::ClosePending && entry.in_flight == 0
        })?;
        match idle {
            None => Ok(ConnectionState::Closed),
            Some((name, _, true)) => {
                self.unregister(&name, id)?;
                Ok(ConnectionState::Closed)
            }
            Some((_, _, false)) => self.state(id),
        }
    }

    /// Current state of a connection; unregistered connections are Closed.
    pub fn state(&self, id: ConnectionId) -> RegistryResult<ConnectionState> {
        let state = self.with_entry(id, |connections, index| connections[index].state)?;
        Ok(state.map(|(_, _, s)| s).unwrap_or(ConnectionState::Closed))
    }

    /// Record the start of a transaction. Only Active connections may start one.
    pub fn begin_transaction(&self, id: ConnectionId) -> RegistryResult<()> {
        let started = self.with_entry(id, |connections, index| {
            let entry = &mut connections[index];
            if entry.state == ConnectionState::Active {
                entry.in_flight += 1;
                true
            } else {
                false
            }
        })?;
        match started {
            Some((_, _, true)) => Ok(()),
            Some((_, _, false)) => Err(RegistryError::not_active(id)),
            None => Err(RegistryError::unknown_connection(id)),
        }
    }

    /// Record the end of a transaction, completing a pending close.
    pub fn finish_transaction(&self, id: ConnectionId) -> RegistryResult<()> {
        self.with_entry(id, |connections, index| {
            let entry = &mut connections[index];
            entry.in_flight = entry.in_flight.saturating_sub(1);
        })?;
        self.release_if_idle(id)?;
        Ok(())
    }

    /// Attach a version-change listener to an Active connection.
    pub fn add_listener(&self, id: ConnectionId, listener: VersionChangeListener) -> RegistryResult<()> {
        let added = self.with_entry(id, |connections, index| {
            let entry = &mut connections[index];
            if entry.state == ConnectionState::Active {
                entry.listeners.push(listener);
                true
            } else {
                false
            }
        })?;
        match added {
            Some((_, _, true)) => Ok(()),
            Some((_, _, false)) => Err(RegistryError::not_active(id)),
            None => Err(RegistryError::unknown_connection(id)),
        }
    }

    /// Listeners of a connection, if it is still Active.
    pub fn listeners(&self, id: ConnectionId) -> RegistryResult<Vec<VersionChangeListener>> {
        let listeners = self.with_entry(id, |connections, index| {
            let entry = &connections[index];
            if entry.state == ConnectionState::Active {
                entry.listeners.clone()
            } else {
                Vec::new()
            }
        })?;
        Ok(listeners.map(|(_, _, l)| l).unwrap_or_default())
    }

    /// Subscribe to a store's change generation.
    pub fn subscribe(&self, name: &str) -> RegistryResult<watch::Receiver<u64>> {
        Ok(self.slot_or_create(name)?.changes.subscribe())
    }

    /// Number of registered connections across all stores.
    pub fn connection_count(&self) -> usize {
        self.owners.read().map(|o| o.len()).unwrap_or(0)
    }
}
