//! Qdrant-backed vector store

use crate::{rank_hits, vector_id_for, StorageError, VectorStore};
use async_trait::async_trait;
use codeweave_core::{
    Error, Result, ScoredVector, SearchFilters, VectorMetadata, VectorRecord,
};
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance,
    Filter, PointId, PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Extra hits fetched so equal scores at the cut-off are ordered by entity id
const TIE_BREAK_HEADROOM: usize = 16;

/// Vector store over one Qdrant collection
pub struct QdrantVectorStore {
    client: Qdrant,
    collection_name: String,
    dimension: AtomicUsize,
}

impl QdrantVectorStore {
    /// Connect and verify the server answers
    pub async fn connect(url: &str, collection_name: &str) -> Result<Self> {
        info!(url = %url, collection = %collection_name, "Connecting to Qdrant");
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| StorageError::ConnectionFailed(format!("Qdrant: {e}")))?;
        client
            .health_check()
            .await
            .map_err(|e| Error::storage(format!("Qdrant health check failed: {e}")))?;
        Ok(Self {
            client,
            collection_name: collection_name.to_string(),
            dimension: AtomicUsize::new(0),
        })
    }

    fn metadata_payload(record: &VectorRecord) -> Payload {
        let mut map = serde_json::Map::new();
        let metadata = &record.metadata;
        for (key, value) in [
            ("entity_id", record.entity_id.clone()),
            ("repository_id", metadata.repository_id.clone()),
            ("file_id", metadata.file_id.clone()),
            ("file_path", metadata.file_path.clone()),
            ("qualified_name", metadata.qualified_name.clone()),
            ("kind", metadata.kind.to_string()),
            ("language", metadata.language.to_string()),
        ] {
            map.insert(key.to_string(), serde_json::Value::String(value));
        }
        Payload::from(map)
    }

    fn payload_to_hit(payload: &HashMap<String, QdrantValue>, score: f32) -> Option<ScoredVector> {
        let get_string = |key: &str| -> Option<String> {
            payload.get(key).and_then(|v| match v.kind.as_ref()? {
                Kind::StringValue(s) => Some(s.clone()),
                _ => None,
            })
        };
        Some(ScoredVector {
            entity_id: get_string("entity_id")?,
            score,
            metadata: VectorMetadata {
                repository_id: get_string("repository_id")?,
                file_id: get_string("file_id")?,
                file_path: get_string("file_path")?,
                qualified_name: get_string("qualified_name")?,
                kind: FromStr::from_str(&get_string("kind")?).ok()?,
                language: FromStr::from_str(&get_string("language")?).ok()?,
            },
        })
    }

    fn build_filter(filters: &SearchFilters) -> Option<Filter> {
        let mut conditions = Vec::new();
        if let Some(repository_id) = &filters.repository_id {
            conditions.push(Condition::matches("repository_id", repository_id.clone()));
        }
        if let Some(language) = filters.language {
            conditions.push(Condition::matches("language", language.to_string()));
        }
        if let Some(kind) = filters.kind {
            conditions.push(Condition::matches("kind", kind.to_string()));
        }
        if let Some(file_path) = &filters.file_path {
            conditions.push(Condition::matches("file_path", file_path.clone()));
        }
        if conditions.is_empty() {
            None
        } else {
            Some(Filter::must(conditions))
        }
    }

    fn file_filter(file_id: &str) -> Filter {
        Filter::must([Condition::matches("file_id", file_id.to_string())])
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_ready(&self, dimension: usize) -> Result<()> {
        self.dimension.store(dimension, Ordering::SeqCst);
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| Error::storage(format!("Failed to check collection: {e}")))?;
        if exists {
            return Ok(());
        }

        info!(collection = %self.collection_name, dimension, "Creating Qdrant collection");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| {
                Error::storage(format!(
                    "Failed to create collection {}: {e}",
                    self.collection_name
                ))
            })?;
        Ok(())
    }

    async fn add_vectors(&self, records: &[VectorRecord]) -> Result<Vec<String>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let expected = self.dimension.load(Ordering::SeqCst);
        if expected > 0 {
            if let Some(bad) = records.iter().find(|r| r.vector.len() != expected) {
                return Err(StorageError::InvalidDimensions {
                    expected,
                    actual: bad.vector.len(),
                }
                .into());
            }
        }

        let ids: Vec<String> = records.iter().map(|r| vector_id_for(&r.entity_id)).collect();
        let points: Vec<PointStruct> = records
            .iter()
            .zip(&ids)
            .map(|(record, id)| {
                PointStruct::new(
                    PointId::from(id.clone()),
                    record.vector.clone(),
                    Self::metadata_payload(record),
                )
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(|e| Error::storage(format!("Failed to upsert vectors: {e}")))?;
        Ok(ids)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredVector>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut request = SearchPointsBuilder::new(
            &self.collection_name,
            vector.to_vec(),
            (limit + TIE_BREAK_HEADROOM) as u64,
        )
        .with_payload(true);
        if let Some(filter) = Self::build_filter(filters) {
            request = request.filter(filter);
        }

        let response = self
            .client
            .search_points(request)
            .await
            .map_err(|e| Error::storage(format!("Failed to search vectors: {e}")))?;

        let hits = response
            .result
            .iter()
            .filter_map(|point| Self::payload_to_hit(&point.payload, point.score))
            .collect();
        Ok(rank_hits(hits, limit))
    }

    async fn delete_vectors_for_file(&self, file_id: &str) -> Result<u64> {
        let counted = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection_name)
                    .filter(Self::file_filter(file_id))
                    .exact(true),
            )
            .await
            .map_err(|e| Error::storage(format!("Failed to count vectors: {e}")))?;
        let count = counted.result.map(|r| r.count).unwrap_or(0);
        if count == 0 {
            return Ok(0);
        }

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(Self::file_filter(file_id))
                    .wait(true),
            )
            .await
            .map_err(|e| Error::storage(format!("Failed to delete vectors: {e}")))?;
        Ok(count)
    }
}
