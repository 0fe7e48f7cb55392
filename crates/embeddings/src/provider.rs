//! The seam between the indexer and whatever produces vectors

use async_trait::async_trait;
use codeweave_core::error::Result;

/// Source of embedding vectors
///
/// Failures surface as [`codeweave_core::Error::Embedding`] with `retryable`
/// set when repeating the same request could succeed.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per text, in input order
    ///
    /// Callers may pass any number of texts; remote providers send them in
    /// requests of at most [`max_batch_size`](Self::max_batch_size).
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Length of every vector this provider returns
    fn embedding_dimension(&self) -> usize;

    fn max_batch_size(&self) -> usize;
}
