//! Caller-facing transactions
//!
//! A `Transaction` wraps an engine `TransactionHandle`. Connection
//! transactions report back to the registry when they finish so a pending
//! close can complete. Upgrade transactions have no owning connection and are
//! committed by the executor together with the new version.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::registry::{ConnectionControl, RegistryError};
use crate::storage::{StorageEngine, StorageError, TransactionHandle, TransactionMode};

/// Transaction errors
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The engine rejected the operation
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// The owning connection cannot start work
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The transaction was already committed or aborted
    #[error("transaction already finished")]
    Finished,
}

/// Result type for transaction operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// A unit of work against one store.
pub struct Transaction {
    engine: Arc<dyn StorageEngine>,
    handle: Option<TransactionHandle>,
    owner: Option<ConnectionControl>,
}

impl Transaction {
    pub(crate) fn for_connection(
        engine: Arc<dyn StorageEngine>,
        handle: TransactionHandle,
        owner: ConnectionControl,
    ) -> Self {
        Self {
            engine,
            handle: Some(handle),
            owner: Some(owner),
        }
    }

    pub(crate) fn for_upgrade(engine: Arc<dyn StorageEngine>, handle: TransactionHandle) -> Self {
        Self {
            engine,
            handle: Some(handle),
            owner: None,
        }
    }

    fn handle(&self) -> TransactionResult<&TransactionHandle> {
        self.handle.as_ref().ok_or(TransactionError::Finished)
    }

    fn handle_mut(&mut self) -> TransactionResult<&mut TransactionHandle> {
        self.handle.as_mut().ok_or(TransactionError::Finished)
    }

    /// Access mode. Finished transactions report read-only.
    pub fn mode(&self) -> TransactionMode {
        self.handle
            .as_ref()
            .map(|h| h.scope().mode)
            .unwrap_or(TransactionMode::ReadOnly)
    }

    /// Store this transaction is scoped to.
    pub fn store(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.scope().store.as_str())
    }

    /// Read a record.
    pub fn get(&self, key: &str) -> TransactionResult<Option<Value>> {
        let handle = self.handle()?;
        Ok(self.engine.get(handle, key)?)
    }

    /// Write a record.
    pub fn put(&mut self, key: &str, value: Value) -> TransactionResult<()> {
        let engine = Arc::clone(&self.engine);
        let handle = self.handle_mut()?;
        Ok(engine.put(handle, key, value)?)
    }

    /// Delete a record.
    pub fn delete(&mut self, key: &str) -> TransactionResult<()> {
        let engine = Arc::clone(&self.engine);
        let handle = self.handle_mut()?;
        Ok(engine.delete(handle, key)?)
    }

    /// Commit all writes atomically.
    pub fn commit(mut self) -> TransactionResult<()> {
        let handle = self.handle.take().ok_or(TransactionError::Finished)?;
        let result = self.engine.commit(handle);
        self.finish();
        Ok(result?)
    }

    /// Discard all writes.
    pub fn abort(mut self) {
        if let Some(handle) = self.handle.take() {
            self.engine.abort(handle);
        }
        self.finish();
    }

    pub(crate) fn into_handle(mut self) -> Option<TransactionHandle> {
        let handle = self.handle.take();
        self.finish();
        handle
    }

    fn finish(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.finish_transaction();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.engine.abort(handle);
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryEngine, TransactionScope};
    use serde_json::json;

    fn upgrade_tx(engine: &Arc<MemoryEngine>) -> Transaction {
        let handle = engine
            .begin_transaction(TransactionScope::new("db", TransactionMode::VersionChange))
            .unwrap();
        Transaction::for_upgrade(engine.clone(), handle)
    }

    #[test]
    fn test_reads_see_own_writes() {
        let engine = Arc::new(MemoryEngine::new());
        let mut tx = upgrade_tx(&engine);
        tx.put("a", json!(1)).unwrap();
        assert_eq!(tx.get("a").unwrap(), Some(json!(1)));
        tx.delete("a").unwrap();
        assert_eq!(tx.get("a").unwrap(), None);
        assert_eq!(tx.store(), Some("db"));
    }

    #[test]
    fn test_drop_aborts() {
        let engine = Arc::new(MemoryEngine::new());
        {
            let mut tx = upgrade_tx(&engine);
            tx.put("a", json!(1)).unwrap();
        }
        assert_eq!(engine.read_committed("db", "a").unwrap(), None);
    }

    #[test]
    fn test_into_handle_keeps_writes() {
        let engine = Arc::new(MemoryEngine::new());
        let mut tx = upgrade_tx(&engine);
        tx.put("a", json!(1)).unwrap();
        let handle = tx.into_handle().unwrap();
        assert_eq!(handle.pending_writes(), 1);
    }
}
