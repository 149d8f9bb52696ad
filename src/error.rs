//! Error types for the operator.
//!
//! The taxonomy distinguishes transient cluster errors, which are retried
//! through the work queue's rate limiter, from configuration errors, which
//! are terminal for the current attempt and surface in `status.errorMessage`.

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// The watch bridge could not complete its initial list within the
    /// bounded attempt count. Fatal to startup.
    #[error("initial cache sync for {kind} failed after {attempts} attempts")]
    CacheSyncFailed { kind: String, attempts: u32 },

    /// Unknown flavor in the spec; fails the reconciliation fast.
    #[error("invalid flavor type, expected: small, medium, large (or) x-large, actual: {0}")]
    UnknownFlavor(String),

    /// Malformed spec field combinations (e.g. storage class "none" without
    /// an NFS server).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bounded readiness poll exhausted its attempts.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Post-apply validation found a pod outside the running phase.
    #[error("pod {pod} is not running, phase: {phase}")]
    PodNotRunning { pod: String, phase: String },

    /// Database bootstrap or probe error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error talking to the federator or an instance health endpoint
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("{0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the work queue should retry this key with backoff.
    ///
    /// Conflicts, creation races and readiness timeouts resolve on their own
    /// as the cluster converges; configuration errors never do and require
    /// the operator to edit the resource.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::PodNotRunning { .. } | Error::Database(_) => true,
            Error::Kube(kube::Error::Api(resp)) => {
                // 409 conflict and 404 during a creation race
                resp.code == 409 || resp.code == 404
            }
            Error::Kube(_) | Error::Http(_) => true,
            Error::CacheSyncFailed { .. }
            | Error::UnknownFlavor(_)
            | Error::InvalidConfig(_)
            | Error::Serialization(_)
            | Error::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flavor_is_terminal() {
        assert!(!Error::UnknownFlavor("tiny".into()).is_transient());
    }

    #[test]
    fn readiness_timeout_is_transient() {
        assert!(Error::Timeout("postgres endpoints".into()).is_transient());
    }

    #[test]
    fn conflict_is_transient() {
        let err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        }));
        assert!(err.is_transient());
    }
}
