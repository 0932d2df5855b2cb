//! Ledger error types

use std::fmt;

use crate::storage::{StorageError, StorageErrorCode};

/// Ledger error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    /// The stored version no longer equals the expected old version
    Conflict,
    /// The proposed version does not advance the expected old version
    NonMonotonic,
    /// The underlying engine failed
    Storage,
}

impl LedgerErrorKind {
    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict => "VSTORE_LEDGER_CONFLICT",
            Self::NonMonotonic => "VSTORE_LEDGER_NON_MONOTONIC",
            Self::Storage => "VSTORE_LEDGER_STORAGE",
        }
    }
}

/// Ledger error
#[derive(Debug, Clone)]
pub struct LedgerError {
    /// Error kind
    pub kind: LedgerErrorKind,
    /// Error message
    pub message: String,
    /// Expected and actual versions, for conflicts
    pub versions: Option<(u64, u64)>,
}

impl LedgerError {
    /// Create a new ledger error.
    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            versions: None,
        }
    }

    /// A racing commit moved the version from under us.
    pub fn conflict(store: &str, expected: u64, actual: u64) -> Self {
        Self {
            versions: Some((expected, actual)),
            ..Self::new(
                LedgerErrorKind::Conflict,
                format!(
                    "store '{}' is at version {} but commit expected {}",
                    store, actual, expected
                ),
            )
        }
    }

    /// The proposed version would not advance the store.
    pub fn non_monotonic(store: &str, expected_old: u64, new_version: u64) -> Self {
        Self::new(
            LedgerErrorKind::NonMonotonic,
            format!(
                "store '{}' cannot move from version {} to {}",
                store, expected_old, new_version
            ),
        )
    }

    /// Whether this is a version conflict.
    pub fn is_conflict(&self) -> bool {
        self.kind == LedgerErrorKind::Conflict
    }
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        if e.code() == StorageErrorCode::VersionConflict {
            if let Some(c) = e.conflict() {
                return Self {
                    versions: Some((c.expected, c.actual)),
                    ..Self::new(LedgerErrorKind::Conflict, e.message().to_string())
                };
            }
        }
        Self::new(LedgerErrorKind::Storage, e.to_string())
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for LedgerError {}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
