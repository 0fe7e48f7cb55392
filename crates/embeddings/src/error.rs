//! Error types for the embeddings module

use std::fmt;

/// Errors that can occur during embedding operations
#[derive(Debug)]
pub enum EmbeddingError {
    /// The HTTP request never produced a response (connect failure, timeout)
    RequestFailed(String),

    /// The embedding service answered with a non-success status
    ServiceError { status: u16, body: String },

    /// The response could not be decoded
    InvalidResponse(String),

    /// A returned vector has the wrong length
    DimensionMismatch { expected: usize, actual: usize },

    /// Fewer or more vectors than texts came back
    CountMismatch { expected: usize, actual: usize },

    /// Unsupported provider
    UnsupportedProvider(String),

    /// Configuration error
    ConfigError(String),
}

impl EmbeddingError {
    /// Whether repeating the same request could succeed
    ///
    /// Transport failures, throttling and server errors are retryable. Client
    /// errors and malformed output are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(_) => true,
            Self::ServiceError { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_)
            | Self::DimensionMismatch { .. }
            | Self::CountMismatch { .. }
            | Self::UnsupportedProvider(_)
            | Self::ConfigError(_) => false,
        }
    }
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFailed(msg) => write!(f, "Embedding request failed: {msg}"),
            Self::ServiceError { status, body } => {
                write!(f, "Embedding service returned error {status}: {body}")
            }
            Self::InvalidResponse(msg) => write!(f, "Invalid embedding response: {msg}"),
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {expected}, got {actual}")
            }
            Self::CountMismatch { expected, actual } => {
                write!(f, "Expected {expected} embeddings, got {actual}")
            }
            Self::UnsupportedProvider(provider) => {
                write!(f, "Unsupported embedding provider: {provider}")
            }
            Self::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for EmbeddingError {}

impl From<EmbeddingError> for codeweave_core::error::Error {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::UnsupportedProvider(_) | EmbeddingError::ConfigError(_) => {
                codeweave_core::error::Error::config(err.to_string())
            }
            other => {
                let retryable = other.is_retryable();
                codeweave_core::error::Error::embedding(other.to_string(), retryable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::Error;

    #[test]
    fn test_status_classification() {
        let throttled = EmbeddingError::ServiceError {
            status: 429,
            body: "slow down".to_string(),
        };
        let unavailable = EmbeddingError::ServiceError {
            status: 503,
            body: String::new(),
        };
        let bad_request = EmbeddingError::ServiceError {
            status: 400,
            body: "input too long".to_string(),
        };
        assert!(throttled.is_retryable());
        assert!(unavailable.is_retryable());
        assert!(!bad_request.is_retryable());
    }

    #[test]
    fn test_conversion_keeps_retryability() {
        let err: Error = EmbeddingError::RequestFailed("connection reset".to_string()).into();
        assert!(matches!(err, Error::Embedding { retryable: true, .. }));

        let err: Error = EmbeddingError::DimensionMismatch {
            expected: 8,
            actual: 4,
        }
        .into();
        assert!(matches!(err, Error::Embedding { retryable: false, .. }));

        let err: Error = EmbeddingError::UnsupportedProvider("candle".to_string()).into();
        assert!(matches!(err, Error::Config(_)));
    }
}
