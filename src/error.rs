//! Error types for the task lifecycle layer.

use std::time::Duration;

/// Result type alias for task lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the task lifecycle layer.
///
/// Callers branch on three distinguished conditions: lock contention
/// ([`Error::is_lock_busy`]), not-found ([`Error::is_not_found`]) and
/// timeout ([`Error::is_timeout`]). Everything else is a plain failure
/// carrying enough context to diagnose the operation that produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lock / Registry Errors
    // =========================================================================
    /// The per-container lock could not be acquired within the retry budget.
    #[error("failed to acquire lock for container '{0}'")]
    LockBusy(String),

    /// Container, task or exec process is unknown to the registry or backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// A live pack for this container is already registered.
    #[error("container already exists: {0}")]
    AlreadyExists(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// A remote backend call failed for a reason other than not-found.
    #[error("{operation}: {reason}")]
    Backend { operation: String, reason: String },

    /// A bounded wait expired.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Stdio Attachment Errors
    // =========================================================================
    /// Stream plumbing could not be built or attached.
    #[error("stream attach failed: {0}")]
    Stream(String),

    // =========================================================================
    // Force-Stop Errors
    // =========================================================================
    /// The external force-stop command failed; its exit code and captured
    /// output are folded into the reason.
    #[error("failed to force stop container '{id}': {reason}")]
    ForceStop { id: String, reason: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// A container or exec identifier failed validation.
    #[error("invalid identifier '{id}': {reason}")]
    InvalidIdentifier { id: String, reason: String },

    // =========================================================================
    // I/O / Internal Errors
    // =========================================================================
    /// Generic I/O error (FIFO creation, pipe open, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

// Terminal exit messages are replayed to any number of readers, each of
// which gets an owned copy of the error.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::LockBusy(id) => Self::LockBusy(id.clone()),
            Self::NotFound(what) => Self::NotFound(what.clone()),
            Self::AlreadyExists(id) => Self::AlreadyExists(id.clone()),
            Self::Backend { operation, reason } => Self::Backend {
                operation: operation.clone(),
                reason: reason.clone(),
            },
            Self::Timeout {
                operation,
                duration,
            } => Self::Timeout {
                operation: operation.clone(),
                duration: *duration,
            },
            Self::Stream(reason) => Self::Stream(reason.clone()),
            Self::ForceStop { id, reason } => Self::ForceStop {
                id: id.clone(),
                reason: reason.clone(),
            },
            Self::InvalidIdentifier { id, reason } => Self::InvalidIdentifier {
                id: id.clone(),
                reason: reason.clone(),
            },
            // io::Error is not cloneable; keep the kind and text.
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::Internal(reason) => Self::Internal(reason.clone()),
        }
    }
}

impl Error {
    /// True if this error means the entity is already gone.
    ///
    /// Destroy, pause and the stdin-close worker treat already-gone entities
    /// as success; recover treats it as "delete stale metadata and give up".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True if this error is an expired bounded wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True if this error is per-container lock contention.
    pub fn is_lock_busy(&self) -> bool {
        matches!(self, Self::LockBusy(_))
    }

    /// Wraps a non-branching error with the calling operation's name.
    ///
    /// Not-found and timeout pass through untouched so callers can still
    /// branch on them after wrapping.
    pub fn with_operation(self, operation: &str) -> Self {
        match self {
            Self::NotFound(_) | Self::Timeout { .. } | Self::LockBusy(_) => self,
            other => Self::Backend {
                operation: operation.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
