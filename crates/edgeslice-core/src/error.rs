// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Edgeslice resource handling
#[derive(Error, Debug, Diagnostic)]
pub enum EdgesliceError {
    /// A quantity string could not be parsed
    #[error("Invalid quantity '{value}': {reason}")]
    #[diagnostic(
        code(edgeslice::invalid_quantity),
        help("Use Kubernetes quantity syntax such as '500m', '2', '1.5', '128Mi' or '4Gi'")
    )]
    InvalidQuantity {
        #[allow(unused)]
        value: String,
        #[allow(unused)]
        reason: String,
    },

    /// Invalid resource
    #[error("Invalid resource: {reason}")]
    #[diagnostic(
        code(edgeslice::invalid_resource),
        help("{suggestion}")
    )]
    InvalidResource {
        #[allow(unused)]
        reason: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Invalid work queue or object key
    #[error("Invalid resource key: {key}")]
    #[diagnostic(
        code(edgeslice::invalid_key),
        help("Cluster-scoped keys are bare names, namespaced keys are 'namespace/name'")
    )]
    InvalidKey {
        #[allow(unused)]
        key: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(edgeslice::serialization_error),
        help("Ensure the resource format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unknown kind in a manifest
    #[error("Unknown resource kind: {kind}")]
    #[diagnostic(
        code(edgeslice::invalid_kind),
        help("Supported kinds: Node, Pod, Namespace, ResourceQuota, Slice, SliceClaim, SubNamespace")
    )]
    InvalidKind {
        #[allow(unused)]
        kind: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, EdgesliceError>;

impl EdgesliceError {
    /// Create an InvalidQuantity error
    pub fn invalid_quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidResource error
    pub fn invalid_resource(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidResource {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InvalidKey error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
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

    /// Create an InvalidKind error
    pub fn invalid_kind(kind: impl Into<String>) -> Self {
        Self::InvalidKind { kind: kind.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EdgesliceError::invalid_quantity("12x", "unknown suffix");
        assert!(matches!(err, EdgesliceError::InvalidQuantity { .. }));
        assert_eq!(err.to_string(), "Invalid quantity '12x': unknown suffix");

        let err = EdgesliceError::invalid_key("a/b/c");
        assert!(matches!(err, EdgesliceError::InvalidKey { .. }));
    }
}
