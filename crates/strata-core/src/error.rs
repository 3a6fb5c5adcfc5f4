//! Error types for the core data model.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Handle is zero, stale, or refers to a freed slot.
    #[error("Invalid handle")]
    InvalidHandle,

    /// Argument failed validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Out of bounds access
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
