//! Error taxonomy shared by the pipeline engine, reconciler and autoscaler.

use thiserror::Error;

/// Result type alias for keel operations.
pub type KeelResult<T> = Result<T, KeelError>;

/// Errors surfaced by keel control loops.
///
/// The first five variants are the operational taxonomy: each carries a
/// different retry rule. The rest are setup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    /// Network or registry unavailable. Retried with backoff.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Scan or quality-gate failure. Never retried; needs a new revision.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Optimistic concurrency conflict on the manifest repository.
    #[error("conflict: expected version {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// Live platform could not be reached.
    #[error("platform unreachable: {0}")]
    PlatformUnreachable(String),

    /// Cancelled by an operator or superseded by a newer trigger.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid stage graph: {0}")]
    InvalidGraph(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl KeelError {
    /// Whether a bounded retry is allowed for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientInfra(_) | Self::Conflict { .. })
    }
}
