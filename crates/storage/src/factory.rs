use crate::memory::{MemoryRelationGraph, MemoryStateStore, MemoryVectorStore};
use crate::neo4j::{Neo4jRelationGraph, Neo4jVectorStore};
use crate::postgres::{PostgresRelationGraph, PostgresStateStore};
use crate::qdrant::QdrantVectorStore;
use crate::{RelationGraph, StateStore, StorageError, VectorStore};
use codeweave_core::{Result, StorageConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// The three storage ports of one backend
#[derive(Clone)]
pub struct StorageHandles {
    pub state: Arc<dyn StateStore>,
    pub graph: Arc<dyn RelationGraph>,
    pub vectors: Arc<dyn VectorStore>,
}

impl StorageHandles {
    /// Fresh in-memory backend
    pub fn memory() -> Self {
        Self {
            state: Arc::new(MemoryStateStore::new()),
            graph: Arc::new(MemoryRelationGraph::new()),
            vectors: Arc::new(MemoryVectorStore::new()),
        }
    }

    /// Close every port, logging failures instead of stopping at the first
    pub async fn close(&self) {
        if let Err(e) = self.state.close().await {
            warn!(error = %e, "Failed to close state store");
        }
        if let Err(e) = self.graph.close().await {
            warn!(error = %e, "Failed to close relation graph");
        }
        if let Err(e) = self.vectors.close().await {
            warn!(error = %e, "Failed to close vector store");
        }
    }
}

/// Create the storage backend named by `config.backend`
///
/// # Arguments
/// * `config` - Storage configuration naming the backend and its connection details
/// * `dimension` - Embedding dimension the vector store must accept
///
/// # Returns
/// Connected handles with the vector store ready for `dimension`-sized vectors
///
/// # Errors
/// Returns an error for an unknown backend name or when a connection fails
pub async fn create_storage(config: &StorageConfig, dimension: usize) -> Result<StorageHandles> {
    let handles = match config.backend.as_str() {
        "memory" => StorageHandles::memory(),
        "postgres" => {
            let pool = crate::postgres::connect(config).await?;
            let vectors =
                QdrantVectorStore::connect(&config.qdrant_url, &config.collection_name).await?;
            StorageHandles {
                state: Arc::new(PostgresStateStore::new(pool.clone())),
                graph: Arc::new(PostgresRelationGraph::new(pool)),
                vectors: Arc::new(vectors),
            }
        }
        "neo4j" => {
            let pool = crate::postgres::connect(config).await?;
            let graph = crate::neo4j::connect(config).await?;
            StorageHandles {
                state: Arc::new(PostgresStateStore::new(pool)),
                graph: Arc::new(Neo4jRelationGraph::new(graph.clone())),
                vectors: Arc::new(Neo4jVectorStore::new(graph)),
            }
        }
        other => {
            return Err(StorageError::InvalidConfig(format!(
                "Unsupported storage backend: {other}"
            ))
            .into())
        }
    };

    handles.vectors.ensure_ready(dimension).await?;
    info!(backend = %config.backend, dimension, "Storage ready");
    Ok(handles)
}
