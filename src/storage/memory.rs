//! In-memory storage engine
//!
//! Process-local engine used by tests and by factories configured with
//! `engine = "memory"`. Versions and records live only as long as the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::engine::{CommitRecord, StorageEngine};
use super::errors::{StorageError, StorageResult};

/// Committed state of one store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreImage {
    /// Persisted schema version
    pub version: u64,
    /// Committed records
    pub records: BTreeMap<String, Value>,
}

impl StoreImage {
    /// Apply a commit record, verifying the base version first.
    ///
    /// Nothing is modified when verification fails.
    pub fn apply(&mut self, record: CommitRecord) -> StorageResult<()> {
        if record.base_version != self.version {
            return Err(StorageError::version_conflict(
                &record.store,
                record.base_version,
                self.version,
            ));
        }
        if let Some(new_version) = record.new_version {
            if new_version <= self.version {
                return Err(StorageError::non_monotonic(
                    &record.store,
                    self.version,
                    new_version,
                ));
            }
        }

        for (key, value) in record.writes {
            match value {
                Some(v) => {
                    self.records.insert(key, v);
                }
                None => {
                    self.records.remove(&key);
                }
            }
        }
        if let Some(new_version) = record.new_version {
            self.version = new_version;
        }
        Ok(())
    }
}

/// Storage engine holding every store in memory.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    stores: RwLock<HashMap<String, StoreImage>>,
}

impl MemoryEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StorageError {
        StorageError::unavailable("memory engine lock poisoned")
    }
}

impl StorageEngine for MemoryEngine {
    fn persisted_version(&self, store: &str) -> StorageResult<u64> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        Ok(stores.get(store).map(|image| image.version).unwrap_or(0))
    }

    fn read_committed(&self, store: &str, key: &str) -> StorageResult<Option<Value>> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        Ok(stores
            .get(store)
            .and_then(|image| image.records.get(key).cloned()))
    }

    fn apply(&self, record: CommitRecord) -> StorageResult<()> {
        let mut stores = self.stores.write().map_err(|_| Self::poisoned())?;
        let image = stores.entry(record.store.clone()).or_default();
        // Applying to a copy keeps a failed commit from leaving a half-written store.
        let mut next = image.clone();
        next.apply(record)?;
        *image = next;
        Ok(())
    }

    fn stores(&self) -> StorageResult<Vec<(String, u64)>> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        let mut listed: Vec<_> = stores
            .iter()
            .filter(|(_, image)| image.version > 0)
            .map(|(name, image)| (name.clone(), image.version))
            .collect();
        listed.sort();
        Ok(listed)
    }

    fn record_count(&self, store: &str) -> StorageResult<usize> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        Ok(stores.get(store).map(|image| image.records.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageErrorCode, TransactionMode, TransactionScope};
    use serde_json::json;

    fn upgrade(engine: &MemoryEngine, store: &str, to: u64) {
        let mut tx = engine
            .begin_transaction(TransactionScope::new(store, TransactionMode::VersionChange))
            .unwrap();
        tx.stage_version(to).unwrap();
        engine.commit(tx).unwrap();
    }

    #[test]
    fn test_unknown_store_is_version_zero() {
        let engine = MemoryEngine::new();
        assert_eq!(engine.persisted_version("missing").unwrap(), 0);
        assert!(engine.stores().unwrap().is_empty());
    }

    #[test]
    fn test_version_and_records_commit_together() {
        let engine = MemoryEngine::new();
        let mut tx = engine
            .begin_transaction(TransactionScope::new("db", TransactionMode::VersionChange))
            .unwrap();
        engine.put(&mut tx, "k", json!({"v": 1})).unwrap();
        tx.stage_version(1).unwrap();
        engine.commit(tx).unwrap();

        assert_eq!(engine.persisted_version("db").unwrap(), 1);
        assert_eq!(engine.read_committed("db", "k").unwrap(), Some(json!({"v": 1})));
        assert_eq!(engine.stores().unwrap(), vec![("db".to_string(), 1)]);
    }

    #[test]
    fn test_get_sees_own_writes_and_deletes() {
        let engine = MemoryEngine::new();
        upgrade(&engine, "db", 1);

        let mut tx = engine
            .begin_transaction(TransactionScope::new("db", TransactionMode::ReadWrite))
            .unwrap();
        engine.put(&mut tx, "a", json!(1)).unwrap();
        assert_eq!(engine.get(&tx, "a").unwrap(), Some(json!(1)));
        engine.delete(&mut tx, "a").unwrap();
        assert_eq!(engine.get(&tx, "a").unwrap(), None);
        engine.commit(tx).unwrap();
        assert_eq!(engine.record_count("db").unwrap(), 0);
    }

    #[test]
    fn test_abort_discards_writes() {
        let engine = MemoryEngine::new();
        upgrade(&engine, "db", 1);

        let mut tx = engine
            .begin_transaction(TransactionScope::new("db", TransactionMode::ReadWrite))
            .unwrap();
        engine.put(&mut tx, "a", json!(1)).unwrap();
        engine.abort(tx);
        assert_eq!(engine.read_committed("db", "a").unwrap(), None);
    }

    #[test]
    fn test_stale_base_version_conflicts_and_applies_nothing() {
        let engine = MemoryEngine::new();
        upgrade(&engine, "db", 1);

        let mut stale = engine
            .begin_transaction(TransactionScope::new("db", TransactionMode::ReadWrite))
            .unwrap();
        engine.put(&mut stale, "a", json!(1)).unwrap();

        upgrade(&engine, "db", 2);

        let err = engine.commit(stale).unwrap_err();
        assert_eq!(err.code(), StorageErrorCode::VersionConflict);
        assert_eq!(err.conflict().map(|c| (c.expected, c.actual)), Some((1, 2)));
        assert_eq!(engine.read_committed("db", "a").unwrap(), None);
    }

    #[test]
    fn test_staged_version_must_advance() {
        let engine = MemoryEngine::new();
        upgrade(&engine, "db", 3);

        let mut tx = engine
            .begin_transaction(TransactionScope::new("db", TransactionMode::VersionChange))
            .unwrap();
        tx.stage_version(3).unwrap();
        assert!(engine.commit(tx).is_err());
        assert_eq!(engine.persisted_version("db").unwrap(), 3);
    }
}
