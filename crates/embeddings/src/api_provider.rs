//! OpenAI-compatible API provider for embeddings (vLLM, OpenAI, Jina, etc.)
//!
//! Speaks the `POST {base_url}/embeddings` protocol directly over reqwest.

use crate::{error::EmbeddingError, provider::EmbeddingProvider};
use async_trait::async_trait;
use codeweave_core::error::Result;
use codeweave_core::EmbeddingsConfig;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "http://localhost:8000/v1";

/// Batches in flight at once for a single `embed` call
const MAX_CONCURRENT_REQUESTS: usize = 4;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Request payload for the embeddings endpoint
#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible API provider
pub struct OpenAiCompatibleProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    batch_size: usize,
    retry_attempts: usize,
}

impl OpenAiCompatibleProvider {
    /// Create a new API provider from configuration
    ///
    /// # Arguments
    /// * `config` - Embedding settings (base URL, model, dimension, batching, retries)
    /// * `api_key` - Bearer token, when the service requires one
    pub fn new(config: &EmbeddingsConfig, api_key: Option<String>) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(EmbeddingError::ConfigError("batch_size must be > 0".to_string()).into());
        }
        if config.dimension == 0 {
            return Err(EmbeddingError::ConfigError("dimension must be > 0".to_string()).into());
        }

        let base_url = config
            .api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));

        info!(
            endpoint = %endpoint,
            model = %config.model,
            dimension = config.dimension,
            batch_size = config.batch_size,
            retry_attempts = config.retry_attempts,
            "Initializing OpenAI-compatible embedding provider"
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::ConfigError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: config.model.clone(),
            dimensions: config.dimension,
            batch_size: config.batch_size,
            retry_attempts: config.retry_attempts,
        })
    }

    /// Embed one batch, without retries
    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: Some(self.dimensions),
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EmbeddingError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(EmbeddingError::ServiceError { status, body });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: parsed.data.len(),
            });
        }

        let mut indexed: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        indexed.sort_by_key(|(idx, _)| *idx);

        if let Some((_, bad)) = indexed.iter().find(|(_, e)| e.len() != self.dimensions) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }

        Ok(indexed.into_iter().map(|(_, e)| e).collect())
    }

    /// Embed one batch, retrying retryable failures with exponential backoff
    async fn embed_batch_with_retry(
        &self,
        texts: Vec<String>,
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut attempt = 0;
        loop {
            match self.embed_batch(&texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    attempt += 1;
                    let backoff = retry_delay(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.retry_attempts,
                        batch = texts.len(),
                        "Embedding request failed, retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Backoff before retry number `attempt` (1-based)
fn retry_delay(attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
    RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(RETRY_MAX_DELAY)
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        debug!(
            texts = texts.len(),
            batches = batches.len(),
            "Sending embedding requests"
        );

        // `buffered` keeps batch order, so results line up with `texts`
        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| self.embed_batch_with_retry(batch))
            .buffered(MAX_CONCURRENT_REQUESTS)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }

    fn embedding_dimension(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::Error;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `responses` in order, one per connection, and return the base URL
    async fn serve(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                // Read headers, then the declared body
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let length = text
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if request.len() >= split + 4 + length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        format!("http://{addr}/v1")
    }

    fn config(base_url: String, dimension: usize, retry_attempts: usize) -> EmbeddingsConfig {
        EmbeddingsConfig {
            api_base_url: Some(base_url),
            dimension,
            batch_size: 8,
            timeout_secs: 5,
            retry_attempts,
            ..EmbeddingsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_embeddings_are_returned_in_input_order() {
        let body = r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#;
        let base = serve(vec![(200, body.to_string())]).await;
        let provider = OpenAiCompatibleProvider::new(&config(base, 2, 0), None).unwrap();

        let vectors = provider
            .embed(vec!["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let base = serve(vec![(400, r#"{"error":"bad input"}"#.to_string())]).await;
        let provider = OpenAiCompatibleProvider::new(&config(base, 2, 3), None).unwrap();

        let err = provider.embed(vec!["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Embedding { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let ok = r#"{"data":[{"index":0,"embedding":[0.5,0.5]}]}"#;
        let base = serve(vec![
            (503, "overloaded".to_string()),
            (200, ok.to_string()),
        ])
        .await;
        let provider = OpenAiCompatibleProvider::new(&config(base, 2, 1), None).unwrap();

        let vectors = provider.embed(vec!["x".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![0.5, 0.5]]);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let body = r#"{"data":[{"index":0,"embedding":[1.0,0.0,0.0]}]}"#;
        let base = serve(vec![(200, body.to_string())]).await;
        let provider = OpenAiCompatibleProvider::new(&config(base, 2, 0), None).unwrap();

        let err = provider.embed(vec!["x".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("Dimension mismatch"));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay(1), Duration::from_millis(500));
        assert_eq!(retry_delay(2), Duration::from_secs(1));
        assert_eq!(retry_delay(30), RETRY_MAX_DELAY);
    }
}
