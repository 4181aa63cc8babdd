use thiserror::Error;

/// Structured failure from a generator or evaluator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// The request itself was unusable; retrying the same input will not help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network error, timeout or provider-side 5xx.
    #[error("provider unavailable: {0}")]
    Transient(String),

    /// The provider answered but its output could not be turned into content.
    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GenerationError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether re-running the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }
}
