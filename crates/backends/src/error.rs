//! Error types for backend clients.

use thiserror::Error;

/// Result type alias for backend calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Backend call errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The backend could not be reached or timed out.
    #[error("{backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    /// The backend answered with an error status.
    #[error("{backend} rejected request with status {status}: {body}")]
    Rejected {
        backend: String,
        status: u16,
        body: String,
    },

    /// The referenced job does not exist.
    #[error("{backend} has no job {handle}")]
    NotFound { backend: String, handle: String },

    /// The backend answered with a body that could not be understood.
    #[error("{backend} returned an invalid response: {reason}")]
    InvalidResponse { backend: String, reason: String },

    /// Client configuration is unusable.
    #[error("invalid backend configuration: {0}")]
    Config(String),
}

impl Error {
    /// Create an unavailable error.
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(backend: impl Into<String>, handle: impl ToString) -> Self {
        Self::NotFound {
            backend: backend.into(),
            handle: handle.to_string(),
        }
    }

    /// Create an invalid response error.
    pub fn invalid_response(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Map a reqwest failure for `backend`.
    pub fn from_reqwest(backend: &str, err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::invalid_response(backend, err.to_string())
        } else {
            Self::unavailable(backend, err.to_string())
        }
    }

    /// Check if the call may succeed when retried unchanged.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound { .. } | Self::InvalidResponse { .. } | Self::Config(_) => false,
        }
    }
}
