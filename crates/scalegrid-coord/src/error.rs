use std::time::Duration;

use scalegrid_state::StateError;
use thiserror::Error;

pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("store error: {0}")]
    Store(#[from] StateError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("lease for policy {policy_id} expired or was taken over")]
    LeaseExpired { policy_id: String },

    #[error("node {node} does not own policy {policy_id}")]
    NotOwner { policy_id: String, node: String },

    #[error("malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl CoordError {
    /// Connection loss and timeouts; the caller may retry on its next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordError::Store(e) => e.is_transient(),
            CoordError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Ownership of the policy is definitely gone.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(
            self,
            CoordError::LeaseExpired { .. } | CoordError::NotOwner { .. }
        )
    }
}
