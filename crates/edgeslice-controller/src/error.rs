// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Controller error type
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Storage error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] edgeslice_store::StorageError),

    /// Core error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] edgeslice_core::EdgesliceError),

    /// A work queue key that names no object
    #[error("Invalid work queue key: {key}")]
    #[diagnostic(
        code(controller::invalid_key),
        help("Slice keys are bare names, SliceClaim keys are 'namespace/name'")
    )]
    InvalidKey {
        key: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(controller::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError {
        message: String,
    },
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    /// Create an InvalidKey error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether the error is a NotFound from the store
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }
}
