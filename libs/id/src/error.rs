//! Error types for key parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating keys and patterns.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("key cannot be empty")]
    Empty,

    /// A segment between two separators is empty.
    #[error("key '{key}' has an empty segment")]
    EmptySegment { key: String },

    /// A wildcard appeared where only literal segments are allowed.
    #[error("key '{key}' contains a wildcard; wildcards are only valid in patterns")]
    Wildcard { key: String },

    /// A wildcard was embedded inside a segment (e.g. `user*`).
    #[error("pattern '{pattern}' has a partial wildcard segment")]
    PartialWildcard { pattern: String },

    /// The id is missing the required prefix.
    #[error("invalid id prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The id is missing the underscore separator.
    #[error("id missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the id is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl KeyError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, KeyError::Empty)
    }

    /// Returns true if this error concerns wildcard placement.
    pub fn is_wildcard_error(&self) -> bool {
        matches!(
            self,
            KeyError::Wildcard { .. } | KeyError::PartialWildcard { .. }
        )
    }
}
