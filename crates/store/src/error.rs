//! Error types for the resource store.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Resource store errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The resource does not exist.
    #[error("resource not found: {key}")]
    NotFound { key: String },

    /// A resource with the same identity already exists.
    #[error("resource already exists: {key}")]
    AlreadyExists { key: String },

    /// The write was based on a stale resource version.
    #[error("version conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },

    /// The watch bookmark is too old to resume from; a full re-list is required.
    #[error("bookmark {version} is too old to resume")]
    BookmarkExpired { version: String },

    /// The watch stream failed mid-flight.
    #[error("watch stream error: {0}")]
    Stream(String),

    /// Network-level failure talking to the store.
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with an unexpected HTTP status.
    #[error("unexpected response {status}: {body}")]
    Http { status: u16, body: String },

    /// The store answered with a body that could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration is unusable.
    #[error("invalid store configuration: {0}")]
    Config(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error.
    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a bookmark expired error.
    pub fn bookmark_expired(version: impl Into<String>) -> Self {
        Self::BookmarkExpired {
            version: version.into(),
        }
    }

    /// Check if the operation may succeed when retried unchanged.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Stream(_) | Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Check if this is a version conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if the resource is gone.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport("connection reset".into()).is_transient());
        assert!(
            Error::Http {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !Error::Http {
                status: 403,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!Error::bookmark_expired("12").is_transient());
        assert!(Error::conflict("default/a", "stale").is_conflict());
    }
}
