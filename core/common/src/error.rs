//! Common error types for DealVault.

use thiserror::Error;

/// Top-level error type for DealVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Startup configuration is unusable. Fatal: the process must not serve.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Backing store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The audit record for an operation could not be written.
    ///
    /// The enclosing operation is rolled back with it.
    #[error("Audit log error: {0}")]
    Audit(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A record-level invariant was violated.
    #[error("Validation failed on {field}: {message}")]
    Validation { field: String, message: String },

    /// No acting user is attached to the request.
    #[error("Authentication required")]
    Unauthenticated,

    /// The actor lacks the capability. Always paired with an audit record.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Build a field-level validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a field-level validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Whether this error is a permission denial.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = Error::validation("is_primary", "another active primary account already exists");
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Validation failed on is_primary: another active primary account already exists"
        );
    }

    #[test]
    fn test_access_denied_flag() {
        assert!(Error::AccessDenied("reveal".into()).is_access_denied());
        assert!(!Error::Unauthenticated.is_access_denied());
    }
}
