//! Error types for the wire codec.

use thiserror::Error;

/// Convenience alias for `Result<T, CodecError>`.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while encoding or decoding wire items.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The input buffer ends before the current item is complete. Streaming
    /// callers refill the buffer and retry the decode from the start.
    #[error("truncated input: need {expected} more bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
}

impl CodecError {
    /// Whether more input may turn this failure into a success.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Truncated { .. })
    }
}
