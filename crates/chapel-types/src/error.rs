//! Error types for parsing chapel data.

use thiserror::Error;

/// Errors that can occur when parsing stored or user-supplied values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// A textual value did not name any known variant.
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant {
        /// What was being parsed (e.g. "priority").
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    /// A numeric value was out of the accepted range.
    #[error("Invalid {kind} value: {value}")]
    OutOfRange {
        /// What was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: i64,
    },
}

impl ParseError {
    pub(crate) fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}

/// Result type alias using chapel-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
