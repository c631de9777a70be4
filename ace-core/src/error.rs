//! Error types shared across the core.
//!
//! Every failure mode surfaced by the core maps to one of the wire-level
//! kinds carried by the remote facade, so local and remote callers see the
//! same taxonomy.

use thiserror::Error;

/// Wire-level kind names, used in HTTP error bodies and client mapping.
pub const KIND_NOT_FOUND: &str = "not_found";
pub const KIND_CONFLICT: &str = "conflict";
pub const KIND_DEADLOCK: &str = "deadlock";
pub const KIND_TIMEOUT: &str = "timeout";
pub const KIND_UNAUTHORIZED: &str = "unauthorized";
pub const KIND_VALIDATION_FAILED: &str = "validation_failed";
pub const KIND_UNAVAILABLE: &str = "unavailable";
pub const KIND_FATAL: &str = "fatal";

/// Error type for all core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A referenced entity does not exist. Callers may retry after creating it.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Version mismatch, duplicate create, or stale result.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Acquiring the lock would form a wait-for cycle. The caller must
    /// release everything it holds and retry with backoff.
    #[error("deadlock acquiring lock {name} for owner {owner}")]
    Deadlock { name: String, owner: String },

    /// A lock, queue, or remote call exceeded its deadline.
    #[error("timeout after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Bad or missing API key.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Schema violation or invariant breach on input.
    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    /// A subsystem is down. Callers may retry with backoff.
    #[error("{subsystem} unavailable: {reason}")]
    Unavailable { subsystem: &'static str, reason: String },

    /// Invariant violation inside the core. Aborts the request.
    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn deadlock(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::Deadlock {
            name: name.into(),
            owner: owner.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }

    pub fn unavailable(subsystem: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            subsystem,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// The wire-level kind name for this error.
    #[must_use]
    pub const fn wire_kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => KIND_NOT_FOUND,
            Self::Conflict { .. } => KIND_CONFLICT,
            Self::Deadlock { .. } => KIND_DEADLOCK,
            Self::Timeout { .. } => KIND_TIMEOUT,
            Self::Unauthorized { .. } => KIND_UNAUTHORIZED,
            Self::ValidationFailed { .. } => KIND_VALIDATION_FAILED,
            Self::Unavailable { .. } => KIND_UNAVAILABLE,
            Self::Fatal { .. } => KIND_FATAL,
        }
    }

    /// Reconstruct an error from its wire-level kind and message. Used by the
    /// remote facade client so error handling is identical on both sides.
    #[must_use]
    pub fn from_wire(kind: &str, message: &str) -> Self {
        match kind {
            KIND_NOT_FOUND => Self::NotFound {
                entity: "entity",
                id: message.to_string(),
            },
            KIND_CONFLICT => Self::conflict(message),
            KIND_DEADLOCK => Self::Deadlock {
                name: message.to_string(),
                owner: String::new(),
            },
            KIND_TIMEOUT => Self::timeout(message, 0),
            KIND_UNAUTHORIZED => Self::Unauthorized {
                reason: message.to_string(),
            },
            KIND_VALIDATION_FAILED => Self::validation(message),
            KIND_UNAVAILABLE => Self::unavailable("remote", message),
            _ => Self::fatal(message),
        }
    }

    /// True for kinds the caller is expected to retry with backoff.
    /// Validation and auth errors are never retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Deadlock { .. } | Self::Unavailable { .. }
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::unavailable("storage", err.to_string())
    }
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;
