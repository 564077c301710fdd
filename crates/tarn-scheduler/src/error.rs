//! Scheduler error types.

use tarn_core::ConfigError;
use tarn_health::{CallError, RetryError};
use thiserror::Error;

/// Errors from launch-command construction.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid launch spec: {0}")]
    InvalidSpec(String),
}

pub type LaunchResult<T> = Result<T, LaunchError>;

/// Errors from calls to the cluster allocator or node launcher.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// Timeout or connection failure; worth retrying.
    #[error("transient cluster failure: {0}")]
    Transient(String),

    /// The cluster has no room for the request right now.
    #[error("allocation denied: {0}")]
    AllocationDenied(String),

    #[error("non-retryable cluster failure: {0}")]
    NonRetryable(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ClusterError> },

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("unknown replica: {0}")]
    UnknownReplica(String),

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl ClusterError {
    /// Retry predicate for the retry executor.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

impl From<RetryError<ClusterError>> for ClusterError {
    fn from(err: RetryError<ClusterError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => ClusterError::Exhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::NonRetryable(e) => e,
            RetryError::Cancelled => ClusterError::Cancelled,
        }
    }
}

impl From<CallError<RetryError<ClusterError>>> for ClusterError {
    fn from(err: CallError<RetryError<ClusterError>>) -> Self {
        match err {
            CallError::Rejected(name) => ClusterError::CircuitOpen(name),
            CallError::Inner(e) => e.into(),
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to register with the cluster allocator: {0}")]
    Registration(#[source] ClusterError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ClusterError::Transient("timeout".into()).is_transient());
        assert!(!ClusterError::AllocationDenied("full".into()).is_transient());
        assert!(!ClusterError::NonRetryable("bad".into()).is_transient());
    }

    #[test]
    fn retry_errors_flatten() {
        let exhausted: ClusterError = RetryError::Exhausted {
            attempts: 4,
            last: ClusterError::Transient("timeout".into()),
        }
        .into();
        assert!(matches!(exhausted, ClusterError::Exhausted { attempts: 4, .. }));
        assert_eq!(
            exhausted.to_string(),
            "gave up after 4 attempts: transient cluster failure: timeout"
        );

        let denied: ClusterError =
            RetryError::NonRetryable(ClusterError::AllocationDenied("full".into())).into();
        assert!(matches!(denied, ClusterError::AllocationDenied(_)));

        let rejected: ClusterError =
            CallError::<RetryError<ClusterError>>::Rejected("allocator".into()).into();
        assert!(matches!(rejected, ClusterError::CircuitOpen(name) if name == "allocator"));
    }
}
