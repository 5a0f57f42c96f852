//! Error types for lifewatch

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating observations or relaying group notifications
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Observation Errors
    // =========================================================================
    /// Construction-time contract violation (missing callback, no anchor, conflicting options)
    #[error("Invalid observation configuration: {0}")]
    InvalidConfiguration(String),

    /// A lookup found nothing to act on
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Group Relay Errors
    // =========================================================================
    /// Process is not entitled to the group container, or the group is not registered
    #[error("Not entitled to group: {group}")]
    NotEntitled { group: String },

    /// Post attempted with nobody subscribed and strict posting enabled
    #[error("No subscribers for {name} in group {group}")]
    NoSubscribers { group: String, name: String },

    /// Could not acquire the durable store lock in time
    #[error("Group store is locked: {}", path.display())]
    StoreLocked { path: PathBuf },

    /// Durable store contents could not be understood
    #[error("Group store {} is corrupt: {reason}", path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidConfiguration`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidConfiguration(reason.into())
    }

    /// Whether the caller can reasonably retry or carry on.
    ///
    /// Only construction-time contract violations are treated as programmer errors.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::InvalidConfiguration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::NoSubscribers {
            group: "group.test".to_string(),
            name: "sync".to_string(),
        };
        assert_eq!(err.to_string(), "No subscribers for sync in group group.test");

        let err = Error::StoreLocked {
            path: PathBuf::from("/tmp/g.json.lock"),
        };
        assert_eq!(err.to_string(), "Group store is locked: /tmp/g.json.lock");
    }

    #[test]
    fn test_recoverability() {
        assert!(!Error::invalid("no callback").is_recoverable());
        assert!(Error::NotEntitled {
            group: "g".to_string()
        }
        .is_recoverable());
        assert!(Error::NotFound("x".to_string()).is_recoverable());
    }
}
