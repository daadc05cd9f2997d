//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Covers configuration problems, malformed provider responses and timeouts raised by
/// [`TimeoutProvider`](crate::TimeoutProvider) when its policy is
/// [`TimeoutPolicy::Fail`](crate::TimeoutPolicy::Fail).
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when the embedding configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// The provider returned a different number of vectors than texts submitted
    #[error("Provider returned {actual} embeddings for {expected} texts")]
    CountMismatch { expected: usize, actual: usize },

    /// The provider did not answer in time
    #[error("Embedding request timed out after {after:?}")]
    Timeout { after: Duration },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this error was produced by a timeout rather than by the provider itself.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_and_timeout_flag() {
        let timeout = EmbedError::Timeout {
            after: Duration::from_millis(250),
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "Embedding request timed out after 250ms");

        let mismatch = EmbedError::CountMismatch {
            expected: 3,
            actual: 2,
        };
        assert!(!mismatch.is_timeout());
        assert_eq!(mismatch.to_string(), "Provider returned 2 embeddings for 3 texts");

        let external: EmbedError = anyhow::anyhow!("model server unreachable").into();
        assert!(matches!(external, EmbedError::External { .. }));
        assert!(external.to_string().contains("model server unreachable"));

        assert!(EmbedError::invalid_config("dimension").to_string().contains("dimension"));
    }
}
