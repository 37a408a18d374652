//! Error types for the resources crate.

use thiserror::Error;

/// Result type alias for resource operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Resource model errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A duration string could not be parsed.
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },
}

impl Error {
    /// Create an invalid duration error.
    pub fn invalid_duration(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
