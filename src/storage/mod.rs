//! Storage engine boundary for vstore
//!
//! The version-upgrade protocol treats storage as an external collaborator.
//! This module defines the collaborator interface and ships two engines:
//!
//! - `MemoryEngine`: process-local, for tests and ephemeral stores
//! - `FileEngine`: one checksummed, atomically replaced image file per store
//!
//! # Invariants Enforced
//!
//! - A commit applies its writes and its staged version as one unit
//! - A commit whose base version is stale applies nothing
//! - A store's version only moves forward
//! - Image checksums are verified on every open

mod engine;
mod errors;
mod file;
mod memory;

pub use engine::{CommitRecord, StorageEngine, TransactionHandle, TransactionMode, TransactionScope};
pub use errors::{Severity, StorageError, StorageErrorCode, StorageResult, VersionConflict};
pub use file::{compute_checksum, FileEngine};
pub use memory::{MemoryEngine, StoreImage};
