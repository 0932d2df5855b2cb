//! Storage engine boundary
//!
//! The upgrade protocol never touches records directly. It reads and writes
//! through this trait, which any durable engine can implement by providing
//! four primitives: version lookup, committed reads, atomic apply and
//! store enumeration. Transactions are buffered in a `TransactionHandle`
//! and reach the engine as a single `CommitRecord`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use super::errors::{StorageError, StorageResult};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Reads only
    ReadOnly,
    /// Reads and writes at the bound version
    ReadWrite,
    /// Exclusive upgrade transaction; may advance the store version
    VersionChange,
}

impl TransactionMode {
    /// Mode name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::ReadWrite => "readwrite",
            Self::VersionChange => "versionchange",
        }
    }

    /// Whether this mode accepts writes.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// The store a transaction is scoped to, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionScope {
    /// Store name
    pub store: String,
    /// Access mode
    pub mode: TransactionMode,
}

impl TransactionScope {
    /// Create a scope.
    pub fn new(store: impl Into<String>, mode: TransactionMode) -> Self {
        Self {
            store: store.into(),
            mode,
        }
    }
}

/// A buffered, not yet committed transaction.
///
/// `None` in the write buffer is a pending delete.
#[derive(Debug)]
pub struct TransactionHandle {
    id: u64,
    scope: TransactionScope,
    base_version: u64,
    writes: BTreeMap<String, Option<Value>>,
    target_version: Option<u64>,
}

impl TransactionHandle {
    fn new(scope: TransactionScope, base_version: u64) -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            scope,
            base_version,
            writes: BTreeMap::new(),
            target_version: None,
        }
    }

    /// Process-unique transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Scope of this transaction.
    pub fn scope(&self) -> &TransactionScope {
        &self.scope
    }

    /// The store version observed when the transaction began.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// The version staged for commit, if any.
    pub fn target_version(&self) -> Option<u64> {
        self.target_version
    }

    /// Number of buffered writes (puts and deletes).
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Stage a version advance. Only version-change transactions may do this.
    pub fn stage_version(&mut self, new_version: u64) -> StorageResult<()> {
        if self.scope.mode != TransactionMode::VersionChange {
            return Err(StorageError::read_only(&self.scope.store));
        }
        self.target_version = Some(new_version);
        Ok(())
    }

    fn buffered(&self, key: &str) -> Option<&Option<Value>> {
        self.writes.get(key)
    }

    fn buffer(&mut self, key: &str, value: Option<Value>) -> StorageResult<()> {
        if !self.scope.mode.is_writable() {
            return Err(StorageError::read_only(&self.scope.store));
        }
        self.writes.insert(key.to_string(), value);
        Ok(())
    }

    fn into_record(self) -> CommitRecord {
        CommitRecord {
            store: self.scope.store,
            base_version: self.base_version,
            new_version: self.target_version,
            writes: self.writes,
        }
    }
}

/// Everything a commit must apply as one atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    /// Store name
    pub store: String,
    /// Version the transaction began against; the engine must verify it
    pub base_version: u64,
    /// New store version, written in the same unit as the records
    pub new_version: Option<u64>,
    /// Record writes; `None` deletes
    pub writes: BTreeMap<String, Option<Value>>,
}

/// Storage engine consumed by the upgrade protocol.
pub trait StorageEngine: Send + Sync {
    /// Persisted version of a store; 0 if it has never been created.
    fn persisted_version(&self, store: &str) -> StorageResult<u64>;

    /// Read a committed record.
    fn read_committed(&self, store: &str, key: &str) -> StorageResult<Option<Value>>;

    /// Apply a commit record atomically.
    ///
    /// Must fail with a version conflict, applying nothing, if the store's
    /// current version differs from `record.base_version`.
    fn apply(&self, record: CommitRecord) -> StorageResult<()>;

    /// All created stores with their persisted versions, ordered by name.
    fn stores(&self) -> StorageResult<Vec<(String, u64)>>;

    /// Number of committed records in a store.
    fn record_count(&self, store: &str) -> StorageResult<usize>;

    /// Begin a transaction against the store's current version.
    fn begin_transaction(&self, scope: TransactionScope) -> StorageResult<TransactionHandle> {
        let base_version = self.persisted_version(&scope.store)?;
        Ok(TransactionHandle::new(scope, base_version))
    }

    /// Begin a transaction pinned to a version the caller already observed.
    fn begin_transaction_at(
        &self,
        scope: TransactionScope,
        base_version: u64,
    ) -> StorageResult<TransactionHandle> {
        Ok(TransactionHandle::new(scope, base_version))
    }

    /// Read a record, seeing the transaction's own writes first.
    fn get(&self, tx: &TransactionHandle, key: &str) -> StorageResult<Option<Value>> {
        match tx.buffered(key) {
            Some(pending) => Ok(pending.clone()),
            None => self.read_committed(&tx.scope.store, key),
        }
    }

    /// Buffer a record write.
    fn put(&self, tx: &mut TransactionHandle, key: &str, value: Value) -> StorageResult<()> {
        tx.buffer(key, Some(value))
    }

    /// Buffer a record delete.
    fn delete(&self, tx: &mut TransactionHandle, key: &str) -> StorageResult<()> {
        tx.buffer(key, None)
    }

    /// Commit the transaction. Returns once the engine has made it durable.
    fn commit(&self, tx: TransactionHandle) -> StorageResult<()> {
        self.apply(tx.into_record())
    }

    /// Discard the transaction. Nothing reaches the store.
    fn abort(&self, tx: TransactionHandle) {
        drop(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = TransactionHandle::new(TransactionScope::new("db", TransactionMode::ReadOnly), 1);
        let b = TransactionHandle::new(TransactionScope::new("db", TransactionMode::ReadOnly), 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut tx =
            TransactionHandle::new(TransactionScope::new("db", TransactionMode::ReadOnly), 1);
        assert!(tx.buffer("k", Some(json!(1))).is_err());
        assert!(tx.stage_version(2).is_err());
    }

    #[test]
    fn test_read_write_cannot_stage_version() {
        let mut tx =
            TransactionHandle::new(TransactionScope::new("db", TransactionMode::ReadWrite), 1);
        assert!(tx.buffer("k", Some(json!(1))).is_ok());
        assert!(tx.stage_version(2).is_err());
    }

    #[test]
    fn test_commit_record_carries_staged_version() {
        let mut tx =
            TransactionHandle::new(TransactionScope::new("db", TransactionMode::VersionChange), 3);
        tx.buffer("a", Some(json!("x"))).unwrap();
        tx.buffer("b", None).unwrap();
        tx.stage_version(4).unwrap();
        assert_eq!(tx.pending_writes(), 2);

        let record = tx.into_record();
        assert_eq!(record.store, "db");
        assert_eq!(record.base_version, 3);
        assert_eq!(record.new_version, Some(4));
        assert_eq!(record.writes.get("b"), Some(&None));
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(TransactionMode::ReadOnly.as_str(), "readonly");
        assert_eq!(TransactionMode::VersionChange.as_str(), "versionchange");
        assert!(TransactionMode::VersionChange.is_writable());
    }
}
