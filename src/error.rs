//! Error types for binary store operations.

use std::fmt;

/// Result type for binary store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during binary store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Object absent from the bucket. File storage and the batch handler
    /// downgrade this to a negative result; it only surfaces as an error
    /// from the raw client.
    NotFound { key: String },

    /// Missing or inconsistent configuration, surfaced at setup.
    Config { reason: String },

    /// Local filesystem error while staging or writing a blob.
    Io { source: std::io::Error },

    /// Transport or service error not classified as "not found".
    Network { source: anyhow::Error },

    /// The store's integrity tag disagrees with the expected digest.
    IntegrityMismatch { digest: String, etag: String },

    /// Temporary credential issuance failed.
    Credentials { reason: String },
}

impl StoreError {
    /// Whether this error is the "object absent" classification.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { key } => write!(f, "Object not found: {}", key),
            StoreError::Config { reason } => write!(f, "Configuration error: {}", reason),
            StoreError::Io { source } => write!(f, "I/O error: {}", source),
            StoreError::Network { source } => write!(f, "Network error: {}", source),
            StoreError::IntegrityMismatch { digest, etag } => {
                write!(f, "Invalid ETag, etag={} digest={}", etag, digest)
            }
            StoreError::Credentials { reason } => {
                write!(f, "Credential issuance error: {}", reason)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source } => Some(source),
            StoreError::Network { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io { source: err }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Network { source: err }
    }
}
