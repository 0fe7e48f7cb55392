use thiserror::Error;

/// Result type for codeweave operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for codeweave operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration related errors. Fatal at startup, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Extraction of entities from a single file failed
    #[error("Extraction error in {path}: {message}")]
    Extraction {
        path: String,
        message: String,
        recoverable: bool,
    },

    /// Embedding generation failed
    #[error("Embedding error: {message}")]
    Embedding { message: String, retryable: bool },

    /// A pending reference could not be processed
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// File watching errors
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A requested repository, file or entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Creates a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates an extraction error for `path`
    pub fn extraction(path: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self::Extraction {
            path: path.into(),
            message: message.into(),
            recoverable,
        }
    }

    /// Creates an embedding error
    pub fn embedding(msg: impl Into<String>, retryable: bool) -> Self {
        Self::Embedding {
            message: msg.into(),
            retryable,
        }
    }

    /// Creates a resolution error
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Creates a watcher error
    pub fn watcher(msg: impl Into<String>) -> Self {
        Self::Watcher(msg.into())
    }

    /// Creates an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Adds context to any error
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error came from a storage backend
    ///
    /// Storage errors are the only class the orchestrator treats as loop-level
    /// failures; everything else is recorded against the file being processed.
    pub fn is_storage(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::WithContext { source, .. } => source
                .downcast_ref::<Error>()
                .is_some_and(Error::is_storage),
            _ => false,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::with_context(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_detection_through_context() {
        let err: Result<()> = Err(Error::storage("connection reset"));
        let wrapped = err.context("Failed to claim file").unwrap_err();
        assert!(wrapped.is_storage());
        assert!(!Error::resolution("no candidates").is_storage());
    }

    #[test]
    fn test_extraction_display_includes_path() {
        let err = Error::extraction("src/a.py", "unexpected token", false);
        assert_eq!(
            err.to_string(),
            "Extraction error in src/a.py: unexpected token"
        );
    }
}
