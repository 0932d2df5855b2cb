//! Registry error types

use std::fmt;

/// Registry error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorKind {
    /// Registry state is unavailable (poisoned lock)
    Unavailable,
    /// No registered connection has this id
    UnknownConnection,
    /// The connection is closing or closed
    NotActive,
}

impl RegistryErrorKind {
    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable => "VSTORE_REGISTRY_UNAVAILABLE",
            Self::UnknownConnection => "VSTORE_REGISTRY_UNKNOWN_CONNECTION",
            Self::NotActive => "VSTORE_REGISTRY_NOT_ACTIVE",
        }
    }
}

/// Registry error
#[derive(Debug, Clone)]
pub struct RegistryError {
    /// Error kind
    pub kind: RegistryErrorKind,
    /// Error message
    pub message: String,
}

impl RegistryError {
    /// Create a new registry error.
    pub fn new(kind: RegistryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Registry lock was poisoned by a panicking holder.
    pub fn unavailable() -> Self {
        Self::new(RegistryErrorKind::Unavailable, "connection registry unavailable")
    }

    /// Connection id is not registered.
    pub fn unknown_connection(id: impl fmt::Display) -> Self {
        Self::new(
            RegistryErrorKind::UnknownConnection,
            format!("connection {} is not registered", id),
        )
    }

    /// Connection can no longer start work.
    pub fn not_active(id: impl fmt::Display) -> Self {
        Self::new(
            RegistryErrorKind::NotActive,
            format!("connection {} is closing or closed", id),
        )
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for RegistryError {}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
