//! Error types for the presence subsystem.

use thiserror::Error;

use crate::storage::StorageError;

/// Presence processing errors.
///
/// Authorization denials (an unauthorized probe, for instance) are never
/// reported through this type: they are answered on the wire instead.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The relationship store failed; the operation was aborted before any
    /// stanza left the server.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The stanza is missing a mandatory address or carries an unusable one.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PresenceError {
    /// Create a new bad request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error originated in the relationship store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_converts() {
        let err: PresenceError = StorageError::unavailable("backend down").into();
        assert!(err.is_storage());
        assert_eq!(err.to_string(), "Storage error: Storage unavailable: backend down");
    }

    #[test]
    fn test_bad_request_display() {
        let err = PresenceError::bad_request("missing 'from'");
        assert!(!err.is_storage());
        assert_eq!(err.to_string(), "Bad request: missing 'from'");
    }
}
