use std::time::Duration;

use thiserror::Error;

pub type MetricResult<T> = Result<T, MetricError>;

/// Failures of the metric source. All of them skip one evaluation cycle.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("metric source unavailable: {0}")]
    Unavailable(String),

    #[error("metric query timed out after {0:?}")]
    Timeout(Duration),

    #[error("metric query rejected: {0}")]
    Query(String),

    #[error("query {0:?} returned no samples")]
    NoData(String),

    #[error("unexpected metric response: {0}")]
    Decode(String),
}

impl MetricError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MetricError::Unavailable(_) | MetricError::Timeout(_))
    }
}

/// Failures of one action dispatch attempt.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action request timed out after {0:?}")]
    Timeout(Duration),

    #[error("action target unreachable: {0}")]
    Network(String),

    #[error("action target replied {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid action request: {0}")]
    Request(String),
}

impl ActionError {
    /// Only timeouts are retried; every other failure ends the dispatch.
    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Timeout(_))
    }
}
