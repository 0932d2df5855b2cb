//! Open request errors
//!
//! Everything that can end an open request surfaces as one `OpenError` on
//! the request's terminal channel. Upgrade callbacks report their own
//! failures as `UpgradeError`, which always forces a rollback.

use serde::Serialize;
use thiserror::Error;

use crate::ledger::{LedgerError, LedgerErrorKind};
use crate::registry::RegistryError;
use crate::storage::StorageError;
use crate::transaction::TransactionError;

/// Failure classes, as recorded in `RequestState::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpenErrorKind {
    Version,
    Configuration,
    Abort,
    Constraint,
    Data,
    Conflict,
    Storage,
    Registry,
    Internal,
}

impl OpenErrorKind {
    /// Stable code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Version => "VSTORE_VERSION_ERROR",
            Self::Configuration => "VSTORE_CONFIGURATION_ERROR",
            Self::Abort => "VSTORE_ABORT_ERROR",
            Self::Constraint => "VSTORE_CONSTRAINT_ERROR",
            Self::Data => "VSTORE_DATA_ERROR",
            Self::Conflict => "VSTORE_CONFLICT_ERROR",
            Self::Storage => "VSTORE_STORAGE_ERROR",
            Self::Registry => "VSTORE_REGISTRY_ERROR",
            Self::Internal => "VSTORE_INTERNAL_ERROR",
        }
    }
}

/// Error raised by an upgrade callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    /// A constraint the migration relies on does not hold
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// The migration could not read or write its data
    #[error("data error: {0}")]
    Data(String),
}

impl UpgradeError {
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }
}

impl From<TransactionError> for UpgradeError {
    fn from(err: TransactionError) -> Self {
        Self::Data(err.to_string())
    }
}

/// Terminal failure of an open request.
#[derive(Debug, Error)]
pub enum OpenError {
    /// Requested version is lower than the current one, or zero
    #[error("cannot open '{store}' at version {requested}: current version is {current}")]
    Version {
        store: String,
        requested: u64,
        current: u64,
    },

    /// An upgrade is required but no callback was supplied
    #[error("opening '{store}' at version {requested} requires an upgrade from {current} but no upgrade callback was supplied")]
    Configuration {
        store: String,
        requested: u64,
        current: u64,
    },

    /// The caller cancelled the request
    #[error("open request for '{store}' was aborted")]
    Abort { store: String },

    /// The upgrade callback reported a constraint violation
    #[error("upgrade rolled back: constraint violated: {0}")]
    Constraint(String),

    /// The upgrade callback reported a data error
    #[error("upgrade rolled back: data error: {0}")]
    Data(String),

    /// The ledger saw a racing version commit
    #[error("{0}")]
    Conflict(LedgerError),

    /// The storage engine failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The connection registry is unavailable
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The request could not be driven to an outcome
    #[error("internal error: {0}")]
    Internal(String),
}

impl OpenError {
    /// Failure class.
    pub fn kind(&self) -> OpenErrorKind {
        match self {
            Self::Version { .. } => OpenErrorKind::Version,
            Self::Configuration { .. } => OpenErrorKind::Configuration,
            Self::Abort { .. } => OpenErrorKind::Abort,
            Self::Constraint(_) => OpenErrorKind::Constraint,
            Self::Data(_) => OpenErrorKind::Data,
            Self::Conflict(_) => OpenErrorKind::Conflict,
            Self::Storage(_) => OpenErrorKind::Storage,
            Self::Registry(_) => OpenErrorKind::Registry,
            Self::Internal(_) => OpenErrorKind::Internal,
        }
    }

    /// Create a forbidden state transition error.
    pub fn forbidden_transition(from: &str, to: &str) -> Self {
        Self::Internal(format!("forbidden transition: {} -> {}", from, to))
    }
}

impl From<UpgradeError> for OpenError {
    fn from(err: UpgradeError) -> Self {
        match err {
            UpgradeError::Constraint(message) => Self::Constraint(message),
            UpgradeError::Data(message) => Self::Data(message),
        }
    }
}

impl From<StorageError> for OpenError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<LedgerError> for OpenError {
    fn from(err: LedgerError) -> Self {
        match err.kind {
            LedgerErrorKind::Conflict => Self::Conflict(err),
            LedgerErrorKind::Storage => Self::Storage(err.to_string()),
            LedgerErrorKind::NonMonotonic => Self::Internal(err.to_string()),
        }
    }
}

/// Result type for open request operations
pub type OpenResult<T> = Result<T, OpenError>;
