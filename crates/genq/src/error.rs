//! Error types for the dispatch subsystem.
//!
//! [`Error`] is the request-level taxonomy surfaced to callers of the
//! dispatcher and status resolver. Collaborator failures are reported through
//! their own enums ([`StoreError`], [`QueueError`], [`GeneratorError`]) and
//! fold into [`Error::DependencyUnavailable`] or [`Error::Generator`].
//!
//! ## Error Cases
//! - `Validation`: bad input, never retried.
//! - `Unauthorized`: missing or rejected requester identity.
//! - `RateLimited`: the caller exceeded a request window.
//! - `DependencyUnavailable`: cache store or queue broker unreachable.
//! - `Generator`: the external generator failed or answered nonsense.
//! - `NotFound`: task or association absent.
//! - `ServiceShutdown`: the service is draining.

use core::time::Duration;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the dispatch subsystem.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The request was malformed or violated parameter bounds.
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// No usable requester identity was presented.
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// The caller must wait `retry_after` before trying again.
    #[error("Rate limit exceeded, retry after {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    /// The cache store or queue broker could not serve the request.
    #[error("Dependency unavailable: {context}")]
    DependencyUnavailable { context: String },

    /// The external generator failed.
    #[error("Generator error: {0}")]
    Generator(#[from] GeneratorError),

    /// The task or its requester association does not exist.
    #[error("Task not found")]
    NotFound,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }
}

/// Failures of the shared key-value store.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Failures of the job queue broker.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The lease was reclaimed or the job replaced before the holder
    /// reported back.
    #[error("lease lost for task {key}")]
    LeaseLost { key: String },
}

/// Failures of the external image generator.
///
/// Transport and availability problems are retryable; answers that are
/// well-delivered but unusable are not.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum GeneratorError {
    /// Connection failure, 408/429 or a 5xx from the provider.
    #[error("generator unavailable: {reason}")]
    Unavailable { reason: String },

    /// The invocation exceeded its time budget.
    #[error("generator timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    /// The provider refused the request (non-retryable 4xx).
    #[error("generator rejected request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// The provider answered with a body that does not match its contract.
    #[error("generator returned invalid response: {reason}")]
    Malformed { reason: String },

    /// The provider answered but produced no image URLs.
    #[error("generator returned no image URLs")]
    Empty,
}

impl GeneratorError {
    /// Whether another attempt may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Self::DependencyUnavailable {
            context: err.to_string(),
        }
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Self::DependencyUnavailable {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_generator_errors() {
        assert!(
            GeneratorError::Unavailable {
                reason: "connection reset".into()
            }
            .is_retryable()
        );
        assert!(
            GeneratorError::Timeout {
                after: Duration::from_secs(120)
            }
            .is_retryable()
        );
        assert!(!GeneratorError::Empty.is_retryable());
        assert!(
            !GeneratorError::Malformed {
                reason: "missing data".into()
            }
            .is_retryable()
        );
        assert!(
            !GeneratorError::Rejected {
                status: 400,
                reason: "bad prompt".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn collaborator_failures_become_dependency_errors() {
        let err: Error = QueueError::Unavailable("broker down".into()).into();
        assert!(matches!(err, Error::DependencyUnavailable { .. }));

        let err: Error = StoreError::Unavailable("refused".into()).into();
        assert!(err.to_string().contains("refused"));
    }
}
