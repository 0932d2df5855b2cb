//! Version ledger
//!
//! Owns the persisted schema version of every store. The version is kept as
//! part of the store image inside the storage engine, so advancing it and
//! committing an upgrade's writes happen in the same atomic unit.
//!
//! The ledger enforces two rules on every commit, independently of the
//! request serialization above it:
//! - the stored version must still equal the expected old version
//! - the new version must be strictly greater than the old one

mod errors;

pub use errors::{LedgerError, LedgerErrorKind, LedgerResult};

use std::sync::Arc;

use crate::storage::{StorageEngine, TransactionHandle, TransactionMode, TransactionScope};

/// Persisted `store name -> version` mapping.
pub struct VersionLedger {
    engine: Arc<dyn StorageEngine>,
}

impl VersionLedger {
    /// Create a ledger over an engine.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    /// Current persisted version; 0 if the store was never created.
    pub fn current_version(&self, name: &str) -> LedgerResult<u64> {
        Ok(self.engine.persisted_version(name)?)
    }

    /// Advance a store's version with no accompanying writes.
    pub fn commit(&self, name: &str, expected_old: u64, new_version: u64) -> LedgerResult<()> {
        let handle = self.engine.begin_transaction_at(
            TransactionScope::new(name, TransactionMode::VersionChange),
            expected_old,
        )?;
        self.commit_transaction(handle, expected_old, new_version)
    }

    /// Commit an upgrade transaction together with the new version.
    pub fn commit_transaction(
        &self,
        mut handle: TransactionHandle,
        expected_old: u64,
        new_version: u64,
    ) -> LedgerResult<()> {
        let name = handle.scope().store.clone();
        if new_version <= expected_old {
            self.engine.abort(handle);
            return Err(LedgerError::non_monotonic(&name, expected_old, new_version));
        }
        if handle.base_version() != expected_old {
            let actual = handle.base_version();
            self.engine.abort(handle);
            return Err(LedgerError::conflict(&name, expected_old, actual));
        }

        handle.stage_version(new_version)?;
        self.engine.commit(handle).map_err(|e| {
            let err = LedgerError::from(e);
            if err.is_conflict() {
                let actual = err.versions.map(|(_, actual)| actual).unwrap_or_default();
                LedgerError::conflict(&name, expected_old, actual)
            } else {
                err
            }
        })
    }

    /// All created stores and their versions, ordered by name.
    pub fn stores(&self) -> LedgerResult<Vec<(String, u64)>> {
        Ok(self.engine.stores()?)
    }
}
