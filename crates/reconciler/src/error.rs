//! Error types for the reconciler crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Error)]
pub enum Error {
    /// The resource store failed.
    #[error(transparent)]
    Store(#[from] dprof_store::Error),

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] dprof_backends::Error),

    /// A dispatch call did not answer in time.
    #[error("dispatch to {backend} timed out after {timeout:?}")]
    DispatchTimeout { backend: String, timeout: Duration },

    /// An identity actor could not be started or reached.
    #[error("actor error for {resource}: {reason}")]
    Actor { resource: String, reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a dispatch timeout error.
    pub fn dispatch_timeout(backend: impl Into<String>, timeout: Duration) -> Self {
        Self::DispatchTimeout {
            backend: backend.into(),
            timeout,
        }
    }

    /// Create an actor error.
    pub fn actor(resource: impl ToString, reason: impl Into<String>) -> Self {
        Self::Actor {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Check if a later attempt may succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Backend(e) => e.is_transient(),
            Self::DispatchTimeout { .. } => true,
            Self::Actor { .. } | Self::InvalidConfig { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::dispatch_timeout("profiling-service", Duration::from_secs(30));
        assert!(err.to_string().contains("profiling-service"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_wraps_backend_errors() {
        let err: Error = dprof_backends::Error::not_found("compute-cluster", "J1").into();
        assert_eq!(err.to_string(), "compute-cluster has no job J1");
        assert!(!err.is_transient());
    }
}
