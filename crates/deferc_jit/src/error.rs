use deferc_codec::CodecError;
use thiserror::Error;

/// Faults that abort a build.
///
/// Per-method problems never surface here; they are collected as
/// `(method, reason)` pairs in the build artifact instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(
        "number of methods for deferred compilation exceeds the allowed limit: {count} > {max}\ndeepest call chain:\n{deepest_path}"
    )]
    BudgetExceeded {
        count: usize,
        max: usize,
        deepest_path: String,
    },

    #[error("internal consistency fault: {0}")]
    InvariantViolation(String),

    #[error("decoded graph of {method} differs from the encoded one: {difference}")]
    EncodingMismatch { method: String, difference: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BuildError {
    pub fn invariant(message: impl Into<String>) -> Self {
        BuildError::InvariantViolation(message.into())
    }
}

/// A front end could not produce a graph for a method.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct ParseFailure {
    pub reason: String,
}

impl ParseFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
