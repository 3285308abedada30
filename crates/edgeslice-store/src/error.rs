// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Storage error type
#[derive(Error, Debug, Diagnostic)]
pub enum StorageError {
    /// Object not found
    #[error("Resource not found: {key}")]
    #[diagnostic(
        code(storage::not_found),
        help("Verify the resource exists; it may have been deleted concurrently")
    )]
    NotFound {
        key: String,
    },

    /// Object already exists
    #[error("Resource already exists: {key}")]
    #[diagnostic(
        code(storage::already_exists),
        help("Use update instead of create, or pick a different name")
    )]
    AlreadyExists {
        key: String,
    },

    /// Stale resourceVersion on update
    #[error("Conflict updating {key}: expected resourceVersion {expected}, found {actual}")]
    #[diagnostic(
        code(storage::conflict),
        help("Re-read the resource and retry the update against the latest version")
    )]
    Conflict {
        key: String,
        expected: String,
        actual: String,
    },

    /// Database error
    #[error("Database error: {message}")]
    #[diagnostic(
        code(storage::database_error),
        help("Check database logs and ensure the data directory is accessible and not corrupted")
    )]
    DatabaseError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction error
    #[error("Transaction error: {message}")]
    #[diagnostic(
        code(storage::transaction_error),
        help("Ensure the transaction is not already committed or aborted")
    )]
    TransactionError {
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(storage::serialization_error),
        help("Ensure the data is valid and can be serialized")
    )]
    SerializationError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// JSON patch could not be applied
    #[error("Patch failed for {key}: {message}")]
    #[diagnostic(
        code(storage::patch_failed),
        help("Check that every patch path exists or that its parent does for 'add' operations")
    )]
    PatchFailed {
        key: String,
        message: String,
    },

    /// Resource rejected by validation
    #[error("Invalid resource: {reason}")]
    #[diagnostic(
        code(storage::invalid_resource),
        help("Fix the resource definition; names must be DNS-1123 subdomains")
    )]
    InvalidResource {
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {message}")]
    #[diagnostic(
        code(storage::io_error),
        help("Check filesystem permissions and available disk space")
    )]
    IoError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Create a NotFound error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an AlreadyExists error
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Create a Conflict error
    pub fn conflict(
        key: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            key: key.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a DatabaseError
    pub fn database_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::DatabaseError {
            message: message.into(),
            source,
        }
    }

    /// Create a TransactionError
    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create a PatchFailed error
    pub fn patch_failed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PatchFailed {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidResource error
    pub fn invalid_resource(reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            reason: reason.into(),
        }
    }

    /// Create an IoError
    pub fn io_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::IoError {
            message: message.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        match err {
            redb::Error::TableDoesNotExist(_) => {
                StorageError::database_error("Table does not exist", Some(Box::new(err)))
            }
            _ => StorageError::database_error(format!("redb error: {}", err), Some(Box::new(err))),
        }
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::transaction_error(format!("Transaction error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::database_error(format!("Storage error: {}", err), Some(Box::new(err)))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::database_error(format!("Table error: {}", err), Some(Box::new(err)))
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::transaction_error(format!("Commit error: {}", err))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization_error(format!("JSON error: {}", err), Some(Box::new(err)))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::io_error(format!("I/O error: {}", err), Some(Box::new(err)))
    }
}
