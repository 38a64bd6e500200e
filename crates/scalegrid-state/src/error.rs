//! Error types for the coordination store and record validation.

use thiserror::Error;

use crate::kv::LeaseId;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl StateError {
    /// Whether the failure is worth retrying (connection loss, timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Unavailable(_) | StateError::Timeout(_))
    }
}

/// A record failed validation and must not be stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, reason: impl ToString) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}
