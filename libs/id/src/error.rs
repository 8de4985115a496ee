//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The name string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name exceeds the maximum length.
    #[error("name too long: {actual} characters (max {max})")]
    TooLong { max: usize, actual: usize },

    /// The name contains a control character.
    #[error("invalid character {ch:?} at position {position}")]
    InvalidCharacter { ch: char, position: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
