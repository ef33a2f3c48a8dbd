//! Common error types for llmpipe
//!
//! This module defines all error types used across the worker and the
//! coordinator. Request-level errors map onto the fixed reasons the worker
//! reports to its host in `ERROR: <reason>` frames.

use llmpipe_proto::FrameError;
use thiserror::Error;

/// Wire reason for a failed tokenization
pub const REASON_TOKENIZATION: &str = "tokenization failed";

/// Wire reason for a failed prompt evaluation
pub const REASON_DECODE: &str = "decode failed";

/// Wire reason for any other failure while handling a request
pub const REASON_INTERNAL: &str = "internal error";

/// Main error type for llmpipe
#[derive(Error, Debug)]
pub enum LlmPipeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine backend or model loading errors
    #[error("Model error: {0}")]
    Model(String),

    /// Inference context creation errors
    #[error("Context error: {0}")]
    Context(String),

    /// Vocabulary lookup errors
    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    /// Prompt could not be tokenized
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// Engine reported more items than the staging buffer holds
    #[error("Capacity error: needed {needed}, capacity {capacity}")]
    Capacity { needed: usize, capacity: usize },

    /// Batch evaluation failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// Framing errors on the host channel
    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker answered a request with an error frame
    #[error("Worker error: {0}")]
    Worker(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LlmPipeError {
    /// Reason reported to the host for a request-level failure.
    ///
    /// Returns `None` for errors that are not scoped to a single request.
    pub fn protocol_reason(&self) -> Option<&'static str> {
        match self {
            LlmPipeError::Tokenization(_) | LlmPipeError::Capacity { .. } => Some(REASON_TOKENIZATION),
            LlmPipeError::Decode(_) => Some(REASON_DECODE),
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LlmPipeError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        LlmPipeError::Model(msg.into())
    }

    /// Create a context error
    pub fn context(msg: impl Into<String>) -> Self {
        LlmPipeError::Context(msg.into())
    }

    /// Create a vocabulary error
    pub fn vocabulary(msg: impl Into<String>) -> Self {
        LlmPipeError::Vocabulary(msg.into())
    }

    /// Create a tokenization error
    pub fn tokenization(msg: impl Into<String>) -> Self {
        LlmPipeError::Tokenization(msg.into())
    }

    /// Create a capacity error
    pub fn capacity(needed: usize, capacity: usize) -> Self {
        LlmPipeError::Capacity { needed, capacity }
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        LlmPipeError::Decode(msg.into())
    }

    /// Create a worker error
    pub fn worker(msg: impl Into<String>) -> Self {
        LlmPipeError::Worker(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        LlmPipeError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        LlmPipeError::Internal(msg.into())
    }
}

/// Result type alias for llmpipe operations
pub type Result<T> = std::result::Result<T, LlmPipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_level_reasons() {
        assert_eq!(
            LlmPipeError::tokenization("negative count").protocol_reason(),
            Some("tokenization failed")
        );
        assert_eq!(
            LlmPipeError::capacity(40, 13).protocol_reason(),
            Some("tokenization failed")
        );
        assert_eq!(
            LlmPipeError::decode("llama_decode returned 1").protocol_reason(),
            Some("decode failed")
        );
    }

    #[test]
    fn test_session_errors_have_no_reason() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        assert!(LlmPipeError::from(io).protocol_reason().is_none());
        assert!(LlmPipeError::model("missing file").protocol_reason().is_none());
    }

    #[test]
    fn test_wire_reasons_are_distinct() {
        let reasons = [REASON_TOKENIZATION, REASON_DECODE, REASON_INTERNAL];

        assert_eq!(REASON_INTERNAL, "internal error");
        for (i, a) in reasons.iter().enumerate() {
            assert!(!a.is_empty() && !a.contains('\n'));
            assert!(reasons[i + 1..].iter().all(|b| a != b));
        }
    }

    #[test]
    fn test_frame_error_conversion() {
        let err: LlmPipeError = FrameError::TooLarge { declared: 10, limit: 5 }.into();
        assert!(matches!(err, LlmPipeError::Protocol(_)));
        assert!(err.to_string().contains("exceeds limit"));
    }
}
