//! Store factory
//!
//! Entry point of the engine. A factory owns one storage engine, its
//! version ledger and connection registry, and the controller that runs
//! open requests against them.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use vstore::{StoreFactory, TransactionMode};
//!
//! let factory = StoreFactory::in_memory();
//! let conn = factory
//!     .open_with_upgrade("notes", 1, |tx, _old, _new| {
//!         tx.put("schema", serde_json::json!({"stores": ["notes"]}))?;
//!         Ok(())
//!     })
//!     .outcome()
//!     .await?;
//! let tx = conn.transaction(TransactionMode::ReadOnly)?;
//! assert!(tx.get("schema")?.is_some());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::config::{EngineConfig, EngineKind};
use crate::ledger::LedgerResult;
use crate::observability::{Event, MetricsSnapshot, Telemetry};
use crate::registry::{ConnectionRegistry, ConnectionSnapshot, RegistryResult};
use crate::storage::{FileEngine, MemoryEngine, StorageEngine, StorageError, StorageResult};
use crate::transaction::Transaction;
use crate::upgrade::{
    upgrade_callback, EventTrace, OpenRequest, OpenRequestController, UpgradeError,
};

/// Opens stores and coordinates their version upgrades.
pub struct StoreFactory {
    config: EngineConfig,
    engine: Arc<dyn StorageEngine>,
    registry: Arc<ConnectionRegistry>,
    controller: Arc<OpenRequestController>,
    telemetry: Arc<Telemetry>,
    trace: Arc<EventTrace>,
}

impl StoreFactory {
    /// Build a factory from configuration, opening the configured engine.
    pub fn new(config: EngineConfig) -> StorageResult<Self> {
        let engine: Arc<dyn StorageEngine> = match config.engine {
            EngineKind::Memory => Arc::new(MemoryEngine::new()),
            EngineKind::File => match FileEngine::open(config.data_path()) {
                Ok(engine) => Arc::new(engine),
                Err(e) => {
                    if config.log_events && e.is_fatal() {
                        let message = e.to_string();
                        Telemetry::new(true).emit(
                            Event::StorageCorruption,
                            &[("data_dir", &config.data_dir), ("message", &message)],
                        );
                    }
                    return Err(e);
                }
            },
        };
        Ok(Self::assemble(config, engine))
    }

    /// In-memory factory with logging off.
    pub fn in_memory() -> Self {
        Self::assemble(EngineConfig::in_memory(), Arc::new(MemoryEngine::new()))
    }

    /// Factory over a caller-supplied engine.
    pub fn with_engine(engine: Arc<dyn StorageEngine>, log_events: bool) -> Self {
        let config = EngineConfig::in_memory().with_log_events(log_events);
        Self::assemble(config, engine)
    }

    fn assemble(config: EngineConfig, engine: Arc<dyn StorageEngine>) -> Self {
        let telemetry = Arc::new(Telemetry::new(config.log_events));
        let trace = Arc::new(EventTrace::with_capacity(config.trace_capacity));
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&telemetry)));
        let controller = Arc::new(OpenRequestController::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            Arc::clone(&telemetry),
            Arc::clone(&trace),
        ));

        let engine_name = match config.engine {
            EngineKind::File => "file",
            EngineKind::Memory => "memory",
        };
        telemetry.emit(
            Event::EngineOpened,
            &[("engine", engine_name), ("data_dir", &config.data_dir)],
        );

        Self {
            config,
            engine,
            registry,
            controller,
            telemetry,
            trace,
        }
    }

    /// Open `name` at `version` with no upgrade callback.
    ///
    /// Fails with a configuration error if the store is below `version`.
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, name: &str, version: u64) -> OpenRequest {
        self.controller.open(name, version, None)
    }

    /// Open `name` at `version`, migrating with `callback` if the store is
    /// below it. Must be called from within a Tokio runtime.
    pub fn open_with_upgrade<F>(&self, name: &str, version: u64, callback: F) -> OpenRequest
    where
        F: FnOnce(&mut Transaction, u64, u64) -> Result<(), UpgradeError> + Send + 'static,
    {
        self.controller
            .open(name, version, Some(upgrade_callback(callback)))
    }

    /// Persisted version of a store; 0 if it was never created.
    pub fn current_version(&self, name: &str) -> LedgerResult<u64> {
        self.controller.ledger().current_version(name)
    }

    /// All created stores with their versions, ordered by name.
    pub fn stores(&self) -> LedgerResult<Vec<(String, u64)>> {
        self.controller.ledger().stores()
    }

    /// Committed record count of a store.
    pub fn record_count(&self, name: &str) -> Result<usize, StorageError> {
        self.engine.record_count(name)
    }

    /// Connections of a store that are not yet closed.
    pub fn open_connections(&self, name: &str) -> RegistryResult<Vec<ConnectionSnapshot>> {
        self.registry.list_open(name)
    }

    /// Whether an upgrade transaction is running for `name`.
    pub fn is_upgrading(&self, name: &str) -> bool {
        self.controller.is_upgrading(name)
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.telemetry.metrics().snapshot()
    }

    /// Protocol event trace.
    pub fn trace(&self) -> &EventTrace {
        &self.trace
    }

    /// Configuration this factory was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrade::OpenErrorKind;

    #[tokio::test]
    async fn test_in_memory_factory_creates_store() {
        let factory = StoreFactory::in_memory();
        let conn = factory
            .open_with_upgrade("db", 1, |_, old, new| {
                assert_eq!((old, new), (0, 1));
                Ok(())
            })
            .outcome()
            .await
            .unwrap();

        assert_eq!(conn.version(), 1);
        assert_eq!(factory.current_version("db").unwrap(), 1);
        assert_eq!(factory.stores().unwrap(), vec![("db".to_string(), 1)]);
        assert_eq!(factory.open_connections("db").unwrap().len(), 1);
        assert_eq!(factory.metrics().upgrades_committed, 1);
    }

    #[tokio::test]
    async fn test_open_missing_store_without_callback_fails() {
        let factory = StoreFactory::in_memory();
        let err = factory.open("db", 1).outcome().await.unwrap_err();
        assert_eq!(err.kind(), OpenErrorKind::Configuration);
        assert_eq!(factory.current_version("db").unwrap(), 0);
        assert_eq!(factory.metrics().opens_failed, 1);
    }

    #[test]
    fn test_new_with_file_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::file(dir.path().to_string_lossy().to_string())
            .with_log_events(false);
        let factory = StoreFactory::new(config).unwrap();
        assert!(factory.stores().unwrap().is_empty());
        assert!(dir.path().join("stores").is_dir());
    }

    #[tokio::test]
    async fn test_trace_is_bounded_by_config() {
        let config = EngineConfig::in_memory().with_trace_capacity(4);
        let factory = StoreFactory::new(config).unwrap();
        assert_eq!(factory.trace().capacity(), 4);

        factory
            .open_with_upgrade("db", 1, |_, _, _| Ok(()))
            .outcome()
            .await
            .unwrap();
        for _ in 0..20 {
            factory.open("db", 1).outcome().await.unwrap();
        }

        assert_eq!(factory.trace().len(), 4);
        assert_eq!(factory.metrics().opens_succeeded, 21);
    }
}
