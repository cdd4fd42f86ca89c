//! Errors returned by capability implementations.

use keel_core::{KeelError, ResourceFailure};
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Network blip, registry unavailable, temporary tool failure.
    #[error("transient: {0}")]
    Transient(String),

    /// Optimistic concurrency check failed.
    #[error("conflict: expected version {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// The platform API could not be reached at all.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Some resources were rejected; the rest were applied.
    #[error("partial failure on {} resource(s)", .0.len())]
    PartialFailure(Vec<ResourceFailure>),

    /// Definitive failure (non-zero exit, malformed output, rejected input).
    #[error("failed: {0}")]
    Failed(String),
}

impl GatewayError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unreachable(_))
    }
}

impl From<keel_state::StateError> for GatewayError {
    fn from(err: keel_state::StateError) -> Self {
        match err {
            keel_state::StateError::Conflict { expected, actual } => {
                Self::Conflict { expected, actual }
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<GatewayError> for KeelError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) => KeelError::TransientInfra(msg),
            GatewayError::Conflict { expected, actual } => KeelError::Conflict { expected, actual },
            GatewayError::NotFound(msg) => KeelError::NotFound(msg),
            GatewayError::Unreachable(msg) => KeelError::PlatformUnreachable(msg),
            other => KeelError::TransientInfra(other.to_string()),
        }
    }
}
