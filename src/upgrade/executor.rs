//! Upgrade transaction execution
//!
//! Runs a migration callback inside one version-change transaction and
//! commits its writes together with the new version through the ledger.
//! Any callback error, ledger conflict or storage failure rolls the whole
//! transaction back; the persisted version stays at the old one.
//!
//! Runs are tracked per store. A second run for a store that already has
//! one in progress is refused outright.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::errors::{OpenError, OpenResult};
use super::request::UpgradeCallback;
use super::trace::{EventTrace, TraceEvent};
use crate::ledger::VersionLedger;
use crate::observability::{Event, Telemetry};
use crate::storage::{StorageEngine, TransactionMode, TransactionScope};
use crate::transaction::Transaction;

/// Marks a store as upgrading until dropped.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    store: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.store);
        }
    }
}

/// Executes upgrade transactions.
pub struct UpgradeTransactionExecutor {
    engine: Arc<dyn StorageEngine>,
    ledger: Arc<VersionLedger>,
    telemetry: Arc<Telemetry>,
    trace: Arc<EventTrace>,
    running: Mutex<HashSet<String>>,
}

impl UpgradeTransactionExecutor {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        ledger: Arc<VersionLedger>,
        telemetry: Arc<Telemetry>,
        trace: Arc<EventTrace>,
    ) -> Self {
        Self {
            engine,
            ledger,
            telemetry,
            trace,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Whether an upgrade is running for `store`.
    pub fn is_running(&self, store: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(store))
            .unwrap_or(false)
    }

    fn enter(&self, store: &str) -> OpenResult<RunGuard<'_>> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| OpenError::Internal("upgrade executor unavailable".to_string()))?;
        if !running.insert(store.to_string()) {
            return Err(OpenError::Internal(format!(
                "an upgrade of '{}' is already running",
                store
            )));
        }
        Ok(RunGuard {
            running: &self.running,
            store: store.to_string(),
        })
    }

    /// Run `callback` as the upgrade from `old_version` to `new_version`.
    ///
    /// Blocks until the engine has made the commit durable.
    pub fn run(
        &self,
        store: &str,
        old_version: u64,
        new_version: u64,
        callback: UpgradeCallback,
    ) -> OpenResult<()> {
        let _guard = self.enter(store)?;

        self.trace.record(TraceEvent::UpgradeBegin {
            store: store.to_string(),
            old_version,
            new_version,
        });
        self.log(Event::UpgradeBegin, store, old_version, new_version, None);

        let handle = match self.engine.begin_transaction_at(
            TransactionScope::new(store, TransactionMode::VersionChange),
            old_version,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let err = OpenError::from(e);
                self.rolled_back(store, old_version, new_version, &err);
                return Err(err);
            }
        };

        let mut tx = Transaction::for_upgrade(Arc::clone(&self.engine), handle);
        if let Err(e) = callback(&mut tx, old_version, new_version) {
            tx.abort();
            let err = OpenError::from(e);
            self.rolled_back(store, old_version, new_version, &err);
            return Err(err);
        }

        let Some(handle) = tx.into_handle() else {
            let err = OpenError::Internal("upgrade transaction finished early".to_string());
            self.rolled_back(store, old_version, new_version, &err);
            return Err(err);
        };

        if let Err(e) = self
            .ledger
            .commit_transaction(handle, old_version, new_version)
        {
            if e.is_conflict() {
                let message = e.to_string();
                self.telemetry
                    .emit(Event::LedgerConflict, &[("store", store), ("message", &message)]);
            }
            let err = OpenError::from(e);
            self.rolled_back(store, old_version, new_version, &err);
            return Err(err);
        }

        self.trace.record(TraceEvent::UpgradeCommitted {
            store: store.to_string(),
            old_version,
            new_version,
        });
        self.telemetry.metrics().increment_upgrades_committed();
        self.log(Event::UpgradeCommitted, store, old_version, new_version, None);
        Ok(())
    }

    fn rolled_back(&self, store: &str, old_version: u64, new_version: u64, err: &OpenError) {
        self.trace.record(TraceEvent::UpgradeRolledBack {
            store: store.to_string(),
            old_version,
            new_version,
        });
        self.telemetry.metrics().increment_upgrades_rolled_back();
        self.log(
            Event::UpgradeRolledBack,
            store,
            old_version,
            new_version,
            Some(err),
        );
    }

    fn log(
        &self,
        event: Event,
        store: &str,
        old_version: u64,
        new_version: u64,
        err: Option<&OpenError>,
    ) {
        let old_version = old_version.to_string();
        let new_version = new_version.to_string();
        let message = err.map(|e| e.to_string());
        let mut fields = vec![
            ("store", store),
            ("old_version", old_version.as_str()),
            ("new_version", new_version.as_str()),
        ];
        if let (Some(e), Some(message)) = (err, message.as_deref()) {
            fields.push(("error_code", e.kind().code()));
            fields.push(("message", message));
        }
        self.telemetry.emit(event, &fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEngine;
    use crate::upgrade::errors::{OpenErrorKind, UpgradeError};
    use crate::upgrade::request::upgrade_callback;
    use serde_json::json;

    fn executor() -> (Arc<MemoryEngine>, Arc<VersionLedger>, UpgradeTransactionExecutor) {
        let engine = Arc::new(MemoryEngine::new());
        let ledger = Arc::new(VersionLedger::new(engine.clone()));
        let executor = UpgradeTransactionExecutor::new(
            engine.clone(),
            Arc::clone(&ledger),
            Arc::new(Telemetry::silent()),
            Arc::new(EventTrace::new()),
        );
        (engine, ledger, executor)
    }

    #[test]
    fn test_successful_upgrade_commits_writes_and_version() {
        let (engine, ledger, executor) = executor();
        executor
            .run(
                "db",
                0,
                1,
                upgrade_callback(|tx, old, new| {
                    tx.put("schema", json!({"from": old, "to": new}))?;
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(ledger.current_version("db").unwrap(), 1);
        assert_eq!(
            engine.read_committed("db", "schema").unwrap(),
            Some(json!({"from": 0, "to": 1}))
        );
        assert!(!executor.is_running("db"));
    }

    #[test]
    fn test_callback_error_rolls_back_everything() {
        let (engine, ledger, executor) = executor();
        ledger.commit("db", 0, 1).unwrap();

        let err = executor
            .run(
                "db",
                1,
                2,
                upgrade_callback(|tx, _, _| {
                    tx.put("partial", json!(true))?;
                    Err(UpgradeError::constraint("duplicate key"))
                }),
            )
            .unwrap_err();

        assert_eq!(err.kind(), OpenErrorKind::Constraint);
        assert_eq!(ledger.current_version("db").unwrap(), 1);
        assert_eq!(engine.read_committed("db", "partial").unwrap(), None);
        assert!(!executor.is_running("db"));
    }

    #[test]
    fn test_stale_old_version_is_a_conflict() {
        let (engine, ledger, executor) = executor();
        ledger.commit("db", 0, 2).unwrap();

        let err = executor
            .run(
                "db",
                1,
                3,
                upgrade_callback(|tx, _, _| {
                    tx.put("stale", json!(1))?;
                    Ok(())
                }),
            )
            .unwrap_err();

        assert_eq!(err.kind(), OpenErrorKind::Conflict);
        assert_eq!(ledger.current_version("db").unwrap(), 2);
        assert_eq!(engine.read_committed("db", "stale").unwrap(), None);
    }

    #[test]
    fn test_concurrent_run_on_same_store_is_refused() {
        let (_, _, executor) = executor();
        let _guard = executor.enter("db").unwrap();
        assert!(executor.is_running("db"));

        let err = executor
            .run("db", 0, 1, upgrade_callback(|_, _, _| Ok(())))
            .unwrap_err();
        assert_eq!(err.kind(), OpenErrorKind::Internal);
        assert!(executor.enter("other").is_ok());
    }
}
