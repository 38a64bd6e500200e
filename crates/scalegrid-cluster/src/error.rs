use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("network error talking to {addr}: {reason}")]
    Network { addr: SocketAddr, reason: String },

    #[error("no route to {0}")]
    Unreachable(SocketAddr),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("none of the {attempted} seed peers responded")]
    NoSeedsReachable { attempted: usize },

    #[error("invalid peer config: {0}")]
    Config(String),

    #[error("peer is not running")]
    NotRunning,
}

impl ClusterError {
    /// Send failures and timeouts are retried on the next protocol cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Network { .. } | ClusterError::Unreachable(_) | ClusterError::Timeout(_)
        )
    }
}
