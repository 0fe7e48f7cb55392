//! Mock embedding provider for testing
//!
//! Vectors are a bag of hashed tokens: each lowercase word adds a signed unit
//! to one bucket, and the result is L2-normalized. Texts that share words end
//! up close together, which is enough for search tests to be meaningful.

use crate::error::EmbeddingError;
use crate::provider::EmbeddingProvider;
use async_trait::async_trait;
use codeweave_core::error::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use twox_hash::XxHash64;

const MOCK_BATCH_SIZE: usize = 64;

/// Mock embedding provider that returns deterministic embeddings
pub struct MockEmbeddingProvider {
    embedding_dim: usize,
    /// Calls still to fail before embeddings are returned
    failures_left: AtomicUsize,
    retryable_failures: bool,
}

impl MockEmbeddingProvider {
    /// Create a new mock provider with specified embedding dimension
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            failures_left: AtomicUsize::new(0),
            retryable_failures: true,
        }
    }

    /// Fail the next `count` calls with a service error
    pub fn failing(self, count: usize, retryable: bool) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        Self {
            retryable_failures: retryable,
            ..self
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.embedding_dim];
        if self.embedding_dim == 0 {
            return vector;
        }

        let tokens = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        for token in tokens {
            let hash = XxHash64::oneshot(0, token.as_bytes());
            let bucket = (hash % self.embedding_dim as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            // No tokens: fall back to a fixed axis picked from the raw text
            let bucket = (XxHash64::oneshot(1, text.as_bytes()) % self.embedding_dim as u64) as usize;
            vector[bucket] = 1.0;
            return vector;
        }
        vector.iter_mut().for_each(|v| *v /= norm);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if self.take_failure() {
            let status = if self.retryable_failures { 503 } else { 400 };
            return Err(EmbeddingError::ServiceError {
                status,
                body: "mock failure".to_string(),
            }
            .into());
        }
        Ok(texts.iter().map(|text| self.vector_for(text)).collect())
    }

    fn embedding_dimension(&self) -> usize {
        self.embedding_dim
    }

    fn max_batch_size(&self) -> usize {
        MOCK_BATCH_SIZE
    }
}
