//! Storage error types
//!
//! Error codes:
//! - VSTORE_STORAGE_IO_ERROR (ERROR severity)
//! - VSTORE_STORAGE_VERSION_CONFLICT (ERROR severity)
//! - VSTORE_STORAGE_READ_ONLY (ERROR severity)
//! - VSTORE_STORAGE_UNAVAILABLE (ERROR severity)
//! - VSTORE_DATA_CORRUPTION (FATAL severity)

use std::fmt;
use std::io;

/// Severity levels for storage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, engine continues
    Error,
    /// The store cannot be trusted any more
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Storage-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// Disk I/O failure
    IoError,
    /// The stored version no longer matches the version a transaction began against
    VersionConflict,
    /// Write attempted through a read-only transaction
    ReadOnly,
    /// Engine state is unavailable (poisoned lock)
    Unavailable,
    /// Checksum or format failure in a persisted store image
    DataCorruption,
}

impl StorageErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::IoError => "VSTORE_STORAGE_IO_ERROR",
            StorageErrorCode::VersionConflict => "VSTORE_STORAGE_VERSION_CONFLICT",
            StorageErrorCode::ReadOnly => "VSTORE_STORAGE_READ_ONLY",
            StorageErrorCode::Unavailable => "VSTORE_STORAGE_UNAVAILABLE",
            StorageErrorCode::DataCorruption => "VSTORE_DATA_CORRUPTION",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StorageErrorCode::DataCorruption => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Expected/actual pair carried by a version conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionConflict {
    /// Version the transaction began against
    pub expected: u64,
    /// Version found in the store at commit time
    pub actual: u64,
}

/// Storage error with code, message and optional context
#[derive(Debug)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    details: Option<String>,
    conflict: Option<VersionConflict>,
    source: Option<io::Error>,
}

impl StorageError {
    fn new(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            conflict: None,
            source: None,
        }
    }

    /// Create a new storage I/O error
    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(StorageErrorCode::IoError, message)
        }
    }

    /// Create a version conflict error
    pub fn version_conflict(store: &str, expected: u64, actual: u64) -> Self {
        Self {
            details: Some(format!("store: {}", store)),
            conflict: Some(VersionConflict { expected, actual }),
            ..Self::new(
                StorageErrorCode::VersionConflict,
                format!(
                    "store version is {} but transaction began against {}",
                    actual, expected
                ),
            )
        }
    }

    /// Create an error for a staged version that does not advance the store
    pub fn non_monotonic(store: &str, current: u64, proposed: u64) -> Self {
        Self {
            details: Some(format!("store: {}", store)),
            ..Self::new(
                StorageErrorCode::VersionConflict,
                format!(
                    "staged version {} does not advance current version {}",
                    proposed, current
                ),
            )
        }
    }

    /// Create a read-only violation error
    pub fn read_only(store: &str) -> Self {
        Self {
            details: Some(format!("store: {}", store)),
            ..Self::new(
                StorageErrorCode::ReadOnly,
                "write attempted in a read-only transaction",
            )
        }
    }

    /// Create an unavailable error (poisoned engine lock)
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::Unavailable, message)
    }

    /// Create a data corruption error (FATAL)
    pub fn data_corruption(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::DataCorruption, message)
    }

    /// Create a data corruption error with file context
    pub fn corruption_in_file(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self {
            details: Some(format!("file: {}", path.display())),
            ..Self::data_corruption(reason)
        }
    }

    /// Returns the error code
    pub fn code(&self) -> StorageErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns the expected/actual versions when this is a version conflict
    pub fn conflict(&self) -> Option<VersionConflict> {
        self.conflict
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(StorageErrorCode::IoError.code(), "VSTORE_STORAGE_IO_ERROR");
        assert_eq!(
            StorageErrorCode::VersionConflict.code(),
            "VSTORE_STORAGE_VERSION_CONFLICT"
        );
        assert_eq!(StorageErrorCode::DataCorruption.code(), "VSTORE_DATA_CORRUPTION");
    }

    #[test]
    fn test_data_corruption_is_fatal() {
        let err = StorageError::data_corruption("checksum mismatch");
        assert!(err.is_fatal());
        assert!(!StorageError::read_only("db").is_fatal());
    }

    #[test]
    fn test_version_conflict_carries_versions() {
        let err = StorageError::version_conflict("db", 1, 2);
        assert_eq!(
            err.conflict(),
            Some(VersionConflict {
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(err.details(), Some("store: db"));
    }

    #[test]
    fn test_display_includes_code_and_details() {
        let err = StorageError::read_only("notes");
        let display = format!("{}", err);
        assert!(display.contains("ERROR"));
        assert!(display.contains("VSTORE_STORAGE_READ_ONLY"));
        assert!(display.contains("notes"));
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error;
        let err = StorageError::io_error(
            "write failed",
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        assert!(err.source().is_some());
    }
}
