use codeweave_core::Error as CoreError;
use thiserror::Error;

/// Failures raised inside the storage backends before they reach callers
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A vector whose length differs from the collection's dimension
    #[error("Invalid vector dimensions: expected {expected}, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    /// A persisted value that no longer parses into its domain type
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidConfig(_) => CoreError::config(err.to_string()),
            other => CoreError::storage(other.to_string()),
        }
    }
}
