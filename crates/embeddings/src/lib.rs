//! Embedding generation for code entities
//!
//! This crate provides the embedding capability used by the indexer and the
//! query service: an OpenAI-compatible HTTP provider and a deterministic mock.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use codeweave_core::error::{Error, Result};
use codeweave_core::EmbeddingsConfig;
use std::sync::Arc;
use tracing::info;

mod api_provider;
pub mod error;
mod mock_provider;
pub mod provider;

pub use api_provider::OpenAiCompatibleProvider;
pub use error::EmbeddingError;
pub use mock_provider::MockEmbeddingProvider;
pub use provider::EmbeddingProvider;

/// Environment variable consulted when the config carries no API key
pub const API_KEY_ENV: &str = "EMBEDDING_API_KEY";

/// Manager for handling embedding generation with immutable configuration
pub struct EmbeddingManager {
    provider: Arc<dyn EmbeddingProvider>,
    model_version: String,
}

impl EmbeddingManager {
    /// Creates a new embedding manager with the specified provider and model version
    pub fn new(provider: Arc<dyn EmbeddingProvider>, model_version: impl Into<String>) -> Self {
        Self {
            provider,
            model_version: model_version.into(),
        }
    }

    /// Get reference to the embedding provider
    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    /// Get the model version string
    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dimension(&self) -> usize {
        self.provider.embedding_dimension()
    }

    /// Generate embeddings for texts
    ///
    /// The provider's output is checked against the input: one vector per
    /// text, each of the configured dimension.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        if expected == 0 {
            return Ok(Vec::new());
        }
        let vectors = self.provider.embed(texts).await?;
        if vectors.len() != expected {
            return Err(EmbeddingError::CountMismatch {
                expected,
                actual: vectors.len(),
            }
            .into());
        }
        let dimension = self.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            }
            .into());
        }
        Ok(vectors)
    }

    /// Embed a single search query
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(vec![query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::embedding("Provider returned no embedding for query", false))
    }
}

/// Create an embedding manager from the embeddings section of the config
///
/// The API key comes from the config when set, otherwise from the
/// `EMBEDDING_API_KEY` environment variable.
///
/// # Errors
/// Returns a configuration error for an unknown provider name
pub fn create_embedding_manager(config: &EmbeddingsConfig) -> Result<Arc<EmbeddingManager>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.to_lowercase().as_str() {
        "openai_compatible" | "openai" | "api" => {
            let api_key = config
                .api_key
                .clone()
                .or_else(|| std::env::var(API_KEY_ENV).ok());
            Arc::new(OpenAiCompatibleProvider::new(config, api_key)?)
        }
        "mock" => Arc::new(MockEmbeddingProvider::new(config.dimension)),
        other => return Err(EmbeddingError::UnsupportedProvider(other.to_string()).into()),
    };

    info!(
        provider = %config.provider,
        model = %config.model,
        dimension = config.dimension,
        "Embedding manager ready"
    );
    Ok(Arc::new(EmbeddingManager::new(provider, config.model.clone())))
}
