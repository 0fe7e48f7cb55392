use crate::{rank_hits, vector_id_for, StorageError, VectorStore};
use async_trait::async_trait;
use codeweave_core::{cosine_similarity, Result, ScoredVector, SearchFilters, VectorRecord};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct VectorData {
    dimension: Option<usize>,
    records: HashMap<String, VectorRecord>,
}

/// Brute-force vector store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    data: RwLock<VectorData>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_ready(&self, dimension: usize) -> Result<()> {
        self.data.write().await.dimension = Some(dimension);
        Ok(())
    }

    async fn add_vectors(&self, records: &[VectorRecord]) -> Result<Vec<String>> {
        let mut data = self.data.write().await;
        if let Some(expected) = data.dimension {
            if let Some(bad) = records.iter().find(|r| r.vector.len() != expected) {
                return Err(StorageError::InvalidDimensions {
                    expected,
                    actual: bad.vector.len(),
                }
                .into());
            }
        }
        let ids = records
            .iter()
            .map(|record| {
                data.records
                    .insert(record.entity_id.clone(), record.clone());
                vector_id_for(&record.entity_id)
            })
            .collect();
        Ok(ids)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredVector>> {
        let data = self.data.read().await;
        let hits = data
            .records
            .values()
            .filter(|r| filters.matches(&r.metadata))
            .map(|r| ScoredVector {
                entity_id: r.entity_id.clone(),
                score: cosine_similarity(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        Ok(rank_hits(hits, limit))
    }

    async fn delete_vectors_for_file(&self, file_id: &str) -> Result<u64> {
        let mut data = self.data.write().await;
        let before = data.records.len();
        data.records.retain(|_, r| r.metadata.file_id != file_id);
        Ok((before - data.records.len()) as u64)
    }
}
