use super::storage_error;
use crate::{rank_hits, vector_id_for, StorageError, VectorStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use codeweave_core::{
    EntityKind, Language, ScoredVector, SearchFilters, VectorMetadata, VectorRecord,
};
use neo4rs::{BoltType, Graph, Query, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

const VECTOR_INDEX: &str = "entity_vectors";

/// Candidates pulled from the index per requested hit when filters apply,
/// since the index returns its top-k before the WHERE clause runs
const FILTERED_OVERFETCH: usize = 8;

const TIE_BREAK_HEADROOM: usize = 16;

/// Vectors stored as `EntityVector` node properties behind a cosine vector index
pub struct Neo4jVectorStore {
    graph: Arc<Graph>,
    dimension: AtomicUsize,
}

impl Neo4jVectorStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            dimension: AtomicUsize::new(0),
        }
    }

    fn record_map(record: &VectorRecord) -> HashMap<String, BoltType> {
        let metadata = &record.metadata;
        let embedding: Vec<f64> = record.vector.iter().map(|v| f64::from(*v)).collect();
        let mut map: HashMap<String, BoltType> = HashMap::new();
        map.insert("entity_id".into(), record.entity_id.clone().into());
        map.insert("vector_id".into(), vector_id_for(&record.entity_id).into());
        map.insert("embedding".into(), embedding.into());
        map.insert("repository_id".into(), metadata.repository_id.clone().into());
        map.insert("file_id".into(), metadata.file_id.clone().into());
        map.insert("file_path".into(), metadata.file_path.clone().into());
        map.insert("qualified_name".into(), metadata.qualified_name.clone().into());
        map.insert("kind".into(), metadata.kind.to_string().into());
        map.insert("language".into(), metadata.language.to_string().into());
        map
    }

    fn row_to_hit(row: &Row) -> Result<ScoredVector> {
        let kind: String = row.get("kind")?;
        let language: String = row.get("language")?;
        // Neo4j reports cosine as (1 + cos) / 2
        let normalized: f64 = row.get("score")?;
        Ok(ScoredVector {
            entity_id: row.get("entity_id")?,
            score: (2.0 * normalized - 1.0) as f32,
            metadata: VectorMetadata {
                repository_id: row.get("repository_id")?,
                file_id: row.get("file_id")?,
                file_path: row.get("file_path")?,
                qualified_name: row.get("qualified_name")?,
                kind: EntityKind::from_str(&kind)
                    .map_err(|_| anyhow!("Unexpected entity kind '{kind}'"))?,
                language: Language::from_str(&language)
                    .map_err(|_| anyhow!("Unexpected language '{language}'"))?,
            },
        })
    }

    async fn create_index(&self, dimension: usize) -> Result<()> {
        info!(index = VECTOR_INDEX, dimension, "Ensuring Neo4j vector index");
        let statement = format!(
            "CREATE VECTOR INDEX {VECTOR_INDEX} IF NOT EXISTS
             FOR (v:EntityVector) ON (v.embedding)
             OPTIONS {{indexConfig: {{
                `vector.dimensions`: {dimension},
                `vector.similarity_function`: 'cosine'
             }}}}"
        );
        self.graph
            .run(Query::new(statement))
            .await
            .context("Failed to create vector index")?;
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let maps: Vec<HashMap<String, BoltType>> = records.iter().map(Self::record_map).collect();
        let query = Query::new(
            "UNWIND $records AS record
             MERGE (v:EntityVector {entity_id: record.entity_id})
             SET v += record"
                .to_string(),
        )
        .param("records", maps);
        self.graph
            .run(query)
            .await
            .context("Failed to upsert vectors")?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredVector>> {
        let wanted = limit + TIE_BREAK_HEADROOM;
        let candidates = if filters.is_empty() {
            wanted
        } else {
            wanted * FILTERED_OVERFETCH
        };
        let embedding: Vec<f64> = vector.iter().map(|v| f64::from(*v)).collect();
        let query = Query::new(format!(
            "CALL db.index.vector.queryNodes('{VECTOR_INDEX}', $candidates, $embedding)
             YIELD node AS v, score
             WHERE ($repository_id IS NULL OR v.repository_id = $repository_id)
               AND ($language IS NULL OR v.language = $language)
               AND ($kind IS NULL OR v.kind = $kind)
               AND ($file_path IS NULL OR v.file_path = $file_path)
             RETURN v.entity_id AS entity_id, score, v.repository_id AS repository_id,
                    v.file_id AS file_id, v.file_path AS file_path,
                    v.qualified_name AS qualified_name, v.kind AS kind,
                    v.language AS language
             LIMIT $wanted"
        ))
        .param("candidates", i64::try_from(candidates).unwrap_or(i64::MAX))
        .param("wanted", i64::try_from(wanted).unwrap_or(i64::MAX))
        .param("embedding", embedding)
        .param("repository_id", filters.repository_id.clone())
        .param("language", filters.language.map(|l| l.to_string()))
        .param("kind", filters.kind.map(|k| k.to_string()))
        .param("file_path", filters.file_path.clone());

        let mut result = self.graph.execute(query).await?;
        let mut hits = Vec::new();
        while let Some(row) = result.next().await? {
            hits.push(Self::row_to_hit(&row)?);
        }
        Ok(rank_hits(hits, limit))
    }

    async fn delete_file(&self, file_id: &str) -> Result<u64> {
        let query = Query::new(
            "MATCH (v:EntityVector {file_id: $file_id})
             WITH collect(v) AS doomed
             FOREACH (v IN doomed | DELETE v)
             RETURN size(doomed) AS count"
                .to_string(),
        )
        .param("file_id", file_id);
        let mut result = self.graph.execute(query).await?;
        match result.next().await? {
            Some(row) => Ok(u64::try_from(row.get::<i64>("count")?).unwrap_or(0)),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl VectorStore for Neo4jVectorStore {
    async fn ensure_ready(&self, dimension: usize) -> codeweave_core::Result<()> {
        self.dimension.store(dimension, Ordering::SeqCst);
        self.create_index(dimension).await.map_err(storage_error)
    }

    async fn add_vectors(&self, records: &[VectorRecord]) -> codeweave_core::Result<Vec<String>> {
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
        self.upsert(records).await.map_err(storage_error)?;
        Ok(records.iter().map(|r| vector_id_for(&r.entity_id)).collect())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> codeweave_core::Result<Vec<ScoredVector>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query(vector, limit, filters)
            .await
            .map_err(storage_error)
    }

    async fn delete_vectors_for_file(&self, file_id: &str) -> codeweave_core::Result<u64> {
        self.delete_file(file_id).await.map_err(storage_error)
    }
}
