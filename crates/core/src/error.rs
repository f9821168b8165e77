//! Error types for live call-state synchronization.

use thiserror::Error as ThisError;

/// Result type alias for livecall operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types shared by the hub, the classifier and the reconciliation store.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// A change event or record payload could not be interpreted.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        message: String,
    },
    /// Configuration failed validation.
    #[error("Invalid config: {message}")]
    InvalidConfig {
        message: String,
    },
    /// The permission scope resolver could not answer.
    #[error("Permission scope unavailable: {message}")]
    PermissionUnavailable {
        message: String,
    },
    /// The viewer's authorization session has expired.
    #[error("Authorization session expired")]
    SessionExpired,
    /// The bulk snapshot provider failed.
    #[error("Snapshot unavailable: {message}")]
    SnapshotUnavailable {
        message: String,
    },
    /// A change-feed channel could not be opened or closed.
    #[error("Transport error on {resource}: {message}")]
    Transport {
        resource: String,
        message: String,
    },
    /// The notification sink rejected a notification.
    #[error("Notification failed: {message}")]
    Notification {
        message: String,
    },
    /// An operation was called in a lifecycle state that does not allow it.
    #[error("Invalid state: {message}")]
    InvalidState {
        message: String,
    },
}

impl Error {
    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Error::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates an invalid config error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a permission unavailable error.
    pub fn permission_unavailable(message: impl Into<String>) -> Self {
        Error::PermissionUnavailable {
            message: message.into(),
        }
    }

    /// Creates a snapshot unavailable error.
    pub fn snapshot_unavailable(message: impl Into<String>) -> Self {
        Error::SnapshotUnavailable {
            message: message.into(),
        }
    }

    /// Creates a transport error for a resource.
    pub fn transport(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a notification error.
    pub fn notification(message: impl Into<String>) -> Self {
        Error::Notification {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    /// Returns true for the expected session-expiry condition.
    #[inline]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::SessionExpired)
    }

    /// Returns true for errors raised while resolving permissions.
    #[inline]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Error::PermissionUnavailable { .. } | Error::SessionExpired)
    }
}
