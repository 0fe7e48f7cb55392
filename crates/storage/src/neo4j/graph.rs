use super::storage_error;
use crate::RelationGraph;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codeweave_core::{
    CodeEntity, CodeRelation, Error, PendingReference, ReferenceStatus, RelationKind,
    SourceSpan,
};
use neo4rs::{BoltType, Graph, Query, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Relationship types that may be interpolated into Cypher
pub const ALLOWED_RELATIONSHIP_TYPES: &[&str] = &[
    "CONTAINS",
    "EXTENDS",
    "IMPLEMENTS",
    "IMPORTS",
    "CALLS",
    "INSTANTIATES",
    "USES_TYPE",
    "REFERENCES",
];

const ENTITY_RETURN: &str = "e.id AS id, e.repository_id AS repository_id, e.file_id AS file_id, \
    e.qualified_name AS qualified_name, e.simple_name AS simple_name, e.kind AS kind, \
    e.language AS language, e.start_line AS start_line, e.end_line AS end_line, \
    e.start_column AS start_column, e.end_column AS end_column, e.signature AS signature, \
    e.docstring AS docstring, e.source_text AS source_text, e.visibility AS visibility, \
    e.vector_id AS vector_id";

const RELATION_RETURN: &str = "r.id AS id, s.id AS source_id, t.id AS target_id, \
    r.kind AS kind, r.repository_id AS repository_id, \
    r.is_cross_repository AS is_cross_repository, r.line_number AS line_number";

const REFERENCE_RETURN: &str = "p.id AS id, p.source_entity_id AS source_entity_id, \
    p.source_qualified_name AS source_qualified_name, \
    p.source_repository_id AS source_repository_id, \
    p.target_qualified_name AS target_qualified_name, p.kind AS kind, p.status AS status, \
    p.attempts AS attempts, p.resolved_target_id AS resolved_target_id, \
    p.line_number AS line_number, p.receiver_expr AS receiver_expr, p.created_at AS created_at";

/// Relationship type for a relation kind, checked against the allowlist
fn relationship_type(kind: RelationKind) -> Result<String> {
    let rel_type = kind.to_string().to_uppercase();
    if !ALLOWED_RELATIONSHIP_TYPES.contains(&rel_type.as_str()) {
        return Err(anyhow!("Invalid relationship type: {rel_type}"));
    }
    Ok(rel_type)
}

fn parse<T: FromStr>(column: &str, value: &str) -> Result<T> {
    T::from_str(value).map_err(|_| anyhow!("Unexpected {column} value '{value}'"))
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| anyhow!("Timestamp out of range: {value}"))
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn entity_map(entity: &CodeEntity) -> HashMap<String, BoltType> {
    let mut map: HashMap<String, BoltType> = HashMap::new();
    map.insert("id".into(), entity.id.clone().into());
    map.insert("repository_id".into(), entity.repository_id.clone().into());
    map.insert("file_id".into(), entity.file_id.clone().into());
    map.insert("qualified_name".into(), entity.qualified_name.clone().into());
    map.insert("simple_name".into(), entity.simple_name.clone().into());
    map.insert("kind".into(), entity.kind.to_string().into());
    map.insert("language".into(), entity.language.to_string().into());
    map.insert("start_line".into(), to_i64(entity.span.start_line).into());
    map.insert("end_line".into(), to_i64(entity.span.end_line).into());
    map.insert("start_column".into(), to_i64(entity.span.start_column).into());
    map.insert("end_column".into(), to_i64(entity.span.end_column).into());
    map.insert("signature".into(), entity.signature.clone().into());
    map.insert("docstring".into(), entity.docstring.clone().into());
    map.insert("source_text".into(), entity.source_text.clone().into());
    map.insert("visibility".into(), entity.visibility.to_string().into());
    map.insert("vector_id".into(), entity.vector_id.clone().into());
    map
}

fn row_to_entity(row: &Row) -> Result<CodeEntity> {
    Ok(CodeEntity {
        id: row.get("id")?,
        repository_id: row.get("repository_id")?,
        file_id: row.get("file_id")?,
        qualified_name: row.get("qualified_name")?,
        simple_name: row.get("simple_name")?,
        kind: parse("entity kind", &row.get::<String>("kind")?)?,
        language: parse("language", &row.get::<String>("language")?)?,
        span: SourceSpan::new(
            to_usize(row.get("start_line")?),
            to_usize(row.get("end_line")?),
            to_usize(row.get("start_column")?),
            to_usize(row.get("end_column")?),
        ),
        signature: row.get("signature")?,
        docstring: row.get("docstring")?,
        source_text: row.get("source_text")?,
        visibility: parse("visibility", &row.get::<String>("visibility")?)?,
        vector_id: row.get("vector_id")?,
    })
}

fn row_to_relation(row: &Row) -> Result<CodeRelation> {
    Ok(CodeRelation {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        kind: parse("relation kind", &row.get::<String>("kind")?)?,
        repository_id: row.get("repository_id")?,
        is_cross_repository: row.get("is_cross_repository")?,
        line_number: row.get::<Option<i64>>("line_number")?.map(to_usize),
    })
}

fn row_to_reference(row: &Row) -> Result<PendingReference> {
    Ok(PendingReference {
        id: row.get("id")?,
        source_entity_id: row.get("source_entity_id")?,
        source_qualified_name: row.get("source_qualified_name")?,
        source_repository_id: row.get("source_repository_id")?,
        target_qualified_name: row.get("target_qualified_name")?,
        kind: parse("relation kind", &row.get::<String>("kind")?)?,
        status: parse("reference status", &row.get::<String>("status")?)?,
        attempts: u32::try_from(row.get::<i64>("attempts")?).unwrap_or(0),
        resolved_target_id: row.get("resolved_target_id")?,
        line_number: row.get::<Option<i64>>("line_number")?.map(to_usize),
        receiver_expr: row.get("receiver_expr")?,
        created_at: from_micros(row.get("created_at")?)?,
    })
}

fn insert_query(entities: &[CodeEntity]) -> Query {
    let maps: Vec<HashMap<String, BoltType>> = entities.iter().map(entity_map).collect();
    Query::new(
        "UNWIND $entities AS entity
         MERGE (e:Entity {id: entity.id})
         SET e += entity"
            .to_string(),
    )
    .param("entities", maps)
}

/// Revert references resolved to the file's entities, drop references
/// sourced at them, then detach-delete the entities
fn cleanup_queries(file_id: &str) -> [Query; 3] {
    [
        Query::new(
            "MATCH (e:Entity {file_id: $file_id})
             WITH collect(e.id) AS ids
             MATCH (p:PendingReference)
             WHERE p.status = 'resolved' AND p.resolved_target_id IN ids
             SET p.status = 'pending', p.attempts = 0,
                 p.resolved_target_id = null, p.claimed_until = null,
                 p.claim_token = null"
                .to_string(),
        )
        .param("file_id", file_id),
        Query::new(
            "MATCH (e:Entity {file_id: $file_id})
             WITH collect(e.id) AS ids
             MATCH (p:PendingReference)
             WHERE p.source_entity_id IN ids
             DELETE p"
                .to_string(),
        )
        .param("file_id", file_id),
        Query::new("MATCH (e:Entity {file_id: $file_id}) DETACH DELETE e".to_string())
            .param("file_id", file_id),
    ]
}

/// Relation graph stored as `Entity` nodes, typed relationships and
/// `PendingReference` nodes
pub struct Neo4jRelationGraph {
    graph: Arc<Graph>,
}

impl Neo4jRelationGraph {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    async fn fetch<T>(&self, query: Query, convert: fn(&Row) -> Result<T>) -> Result<Vec<T>> {
        let mut result = self.graph.execute(query).await?;
        let mut items = Vec::new();
        while let Some(row) = result.next().await? {
            items.push(convert(&row)?);
        }
        Ok(items)
    }

    async fn fetch_count(&self, query: Query) -> Result<u64> {
        let mut result = self.graph.execute(query).await?;
        match result.next().await? {
            Some(row) => Ok(u64::try_from(row.get::<i64>("count")?).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn insert_entities(&self, entities: &[CodeEntity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.graph
            .run(insert_query(entities))
            .await
            .context("Failed to insert entities")?;
        Ok(())
    }

    /// Delete the entities of `file_id` and insert `entities` in one
    /// transaction, returning how many were deleted
    async fn replace_file(&self, file_id: &str, entities: &[CodeEntity]) -> Result<u64> {
        let mut txn = self.graph.start_txn().await?;
        let mut counted = txn
            .execute(
                Query::new("MATCH (e:Entity {file_id: $file_id}) RETURN count(e) AS count".into())
                    .param("file_id", file_id),
            )
            .await?;
        let mut deleted = 0;
        while let Some(row) = counted.next(txn.handle()).await? {
            deleted = u64::try_from(row.get::<i64>("count")?).unwrap_or(0);
        }

        if deleted > 0 {
            txn.run_queries(cleanup_queries(file_id))
                .await
                .context("Failed to delete file entities")?;
        }
        if !entities.is_empty() {
            txn.run(insert_query(entities))
                .await
                .context("Failed to insert entities")?;
        }
        txn.commit().await?;
        Ok(deleted)
    }

    /// Lease up to `limit` claimable references
    ///
    /// The first `SET` takes each node's write lock. The claim predicate is
    /// evaluated again after it, so a reference another resolver leased in
    /// the meantime drops out instead of being claimed twice.
    async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<PendingReference>> {
        let now = Utc::now();
        let until = crate::after(now, lease);
        let token = uuid::Uuid::new_v4().to_string();
        let query = Query::new(format!(
            "MATCH (p:PendingReference)
             WHERE p.status = 'pending'
               AND (p.claimed_until IS NULL OR p.claimed_until <= $now)
             WITH p ORDER BY p.created_at, p.id LIMIT $limit
             SET p.claim_lock = $token
             REMOVE p.claim_lock
             WITH p
             WHERE p.status = 'pending'
               AND (p.claimed_until IS NULL OR p.claimed_until <= $now)
             SET p.claimed_until = $until, p.claim_token = $token
             WITH p WHERE p.claim_token = $token
             RETURN {REFERENCE_RETURN}
             ORDER BY created_at, id"
        ))
        .param("now", micros(now))
        .param("until", micros(until))
        .param("limit", to_i64(limit))
        .param("token", token);
        self.fetch(query, row_to_reference).await
    }
}

#[async_trait]
impl RelationGraph for Neo4jRelationGraph {
    async fn add_entities(&self, entities: &[CodeEntity]) -> codeweave_core::Result<Vec<String>> {
        self.insert_entities(entities)
            .await
            .map_err(storage_error)?;
        Ok(entities.iter().map(|e| e.id.clone()).collect())
    }

    async fn get_entity(&self, id: &str) -> codeweave_core::Result<Option<CodeEntity>> {
        let query = Query::new(format!("MATCH (e:Entity {{id: $id}}) RETURN {ENTITY_RETURN}"))
            .param("id", id);
        let mut found = self
            .fetch(query, row_to_entity)
            .await
            .map_err(storage_error)?;
        Ok(found.pop())
    }

    async fn find_entities_by_name(
        &self,
        qualified_name: &str,
    ) -> codeweave_core::Result<Vec<CodeEntity>> {
        let query = Query::new(format!(
            "MATCH (e:Entity {{qualified_name: $name}}) RETURN {ENTITY_RETURN} ORDER BY id"
        ))
        .param("name", qualified_name);
        self.fetch(query, row_to_entity).await.map_err(storage_error)
    }

    async fn find_entities_by_suffix(
        &self,
        suffix: &str,
        limit: usize,
    ) -> codeweave_core::Result<Vec<CodeEntity>> {
        let query = Query::new(format!(
            "MATCH (e:Entity)
             WHERE e.qualified_name = $suffix OR e.qualified_name ENDS WITH $dotted
             RETURN {ENTITY_RETURN}
             ORDER BY qualified_name, id
             LIMIT $limit"
        ))
        .param("suffix", suffix)
        .param("dotted", format!(".{suffix}"))
        .param("limit", to_i64(limit));
        self.fetch(query, row_to_entity).await.map_err(storage_error)
    }

    async fn entities_for_file(&self, file_id: &str) -> codeweave_core::Result<Vec<CodeEntity>> {
        let query = Query::new(format!(
            "MATCH (e:Entity {{file_id: $file_id}})
             RETURN {ENTITY_RETURN}
             ORDER BY start_line, qualified_name"
        ))
        .param("file_id", file_id);
        self.fetch(query, row_to_entity).await.map_err(storage_error)
    }

    async fn delete_entities_for_file(&self, file_id: &str) -> codeweave_core::Result<u64> {
        self.replace_file(file_id, &[]).await.map_err(storage_error)
    }

    async fn replace_file_entities(
        &self,
        file_id: &str,
        entities: &[CodeEntity],
    ) -> codeweave_core::Result<u64> {
        self.replace_file(file_id, entities)
            .await
            .map_err(storage_error)
    }

    async fn set_vector_id(&self, entity_id: &str, vector_id: &str) -> codeweave_core::Result<()> {
        let query = Query::new(
            "MATCH (e:Entity {id: $id}) SET e.vector_id = $vector_id RETURN count(e) AS count"
                .to_string(),
        )
        .param("id", entity_id)
        .param("vector_id", vector_id);
        let updated = self.fetch_count(query).await.map_err(storage_error)?;
        if updated == 0 {
            return Err(Error::not_found(format!("entity {entity_id}")));
        }
        Ok(())
    }

    async fn add_relation(&self, relation: &CodeRelation) -> codeweave_core::Result<String> {
        let rel_type = relationship_type(relation.kind).map_err(storage_error)?;
        let query = Query::new(format!(
            "MATCH (s:Entity {{id: $source_id}}), (t:Entity {{id: $target_id}})
             MERGE (s)-[r:{rel_type}]->(t)
             ON CREATE SET r.id = $id, r.kind = $kind, r.repository_id = $repository_id,
                           r.is_cross_repository = $is_cross_repository,
                           r.line_number = $line_number
             RETURN r.id AS id"
        ))
        .param("source_id", relation.source_id.as_str())
        .param("target_id", relation.target_id.as_str())
        .param("id", relation.id.as_str())
        .param("kind", relation.kind.to_string())
        .param("repository_id", relation.repository_id.as_str())
        .param("is_cross_repository", relation.is_cross_repository)
        .param("line_number", relation.line_number.map(to_i64));

        let mut ids = self
            .fetch(query, |row| Ok(row.get::<String>("id")?))
            .await
            .map_err(storage_error)?;
        ids.pop().ok_or_else(|| {
            Error::not_found(format!(
                "relation endpoints {} -> {}",
                relation.source_id, relation.target_id
            ))
        })
    }

    async fn relations_from(&self, entity_id: &str) -> codeweave_core::Result<Vec<CodeRelation>> {
        let query = Query::new(format!(
            "MATCH (s:Entity {{id: $id}})-[r]->(t:Entity)
             RETURN {RELATION_RETURN}
             ORDER BY kind, target_id"
        ))
        .param("id", entity_id);
        self.fetch(query, row_to_relation).await.map_err(storage_error)
    }

    async fn relations_to(&self, entity_id: &str) -> codeweave_core::Result<Vec<CodeRelation>> {
        let query = Query::new(format!(
            "MATCH (s:Entity)-[r]->(t:Entity {{id: $id}})
             RETURN {RELATION_RETURN}
             ORDER BY kind, source_id"
        ))
        .param("id", entity_id);
        self.fetch(query, row_to_relation).await.map_err(storage_error)
    }

    async fn add_pending_reference(
        &self,
        reference: &PendingReference,
    ) -> codeweave_core::Result<String> {
        let query = Query::new(
            "CREATE (p:PendingReference {
                id: $id,
                source_entity_id: $source_entity_id,
                source_qualified_name: $source_qualified_name,
                source_repository_id: $source_repository_id,
                target_qualified_name: $target_qualified_name,
                kind: $kind,
                status: $status,
                attempts: $attempts,
                resolved_target_id: $resolved_target_id,
                line_number: $line_number,
                receiver_expr: $receiver_expr,
                created_at: $created_at
             })"
            .to_string(),
        )
        .param("id", reference.id.as_str())
        .param("source_entity_id", reference.source_entity_id.as_str())
        .param("source_qualified_name", reference.source_qualified_name.as_str())
        .param("source_repository_id", reference.source_repository_id.as_str())
        .param("target_qualified_name", reference.target_qualified_name.as_str())
        .param("kind", reference.kind.to_string())
        .param("status", reference.status.to_string())
        .param("attempts", i64::from(reference.attempts))
        .param("resolved_target_id", reference.resolved_target_id.clone())
        .param("line_number", reference.line_number.map(to_i64))
        .param("receiver_expr", reference.receiver_expr.clone())
        .param("created_at", micros(reference.created_at));
        self.graph
            .run(query)
            .await
            .context("Failed to add pending reference")
            .map_err(storage_error)?;
        Ok(reference.id.clone())
    }

    async fn get_pending_reference(
        &self,
        id: &str,
    ) -> codeweave_core::Result<Option<PendingReference>> {
        let query = Query::new(format!(
            "MATCH (p:PendingReference {{id: $id}}) RETURN {REFERENCE_RETURN}"
        ))
        .param("id", id);
        let mut found = self
            .fetch(query, row_to_reference)
            .await
            .map_err(storage_error)?;
        Ok(found.pop())
    }

    async fn claim_pending_references(
        &self,
        limit: usize,
        lease: Duration,
    ) -> codeweave_core::Result<Vec<PendingReference>> {
        self.claim(limit, lease).await.map_err(storage_error)
    }

    async fn resolve_pending_reference(
        &self,
        id: &str,
        target_id: &str,
    ) -> codeweave_core::Result<()> {
        let query = Query::new(
            "MATCH (p:PendingReference {id: $id})
             SET p.status = 'resolved', p.resolved_target_id = $target_id, p.claimed_until = null,
                 p.claim_token = null
             RETURN count(p) AS count"
                .to_string(),
        )
        .param("id", id)
        .param("target_id", target_id);
        let updated = self.fetch_count(query).await.map_err(storage_error)?;
        if updated == 0 {
            return Err(Error::not_found(format!("pending reference {id}")));
        }
        Ok(())
    }

    async fn record_failed_attempt(
        &self,
        id: &str,
        max_attempts: u32,
    ) -> codeweave_core::Result<ReferenceStatus> {
        let query = Query::new(
            "MATCH (p:PendingReference {id: $id})
             SET p.attempts = p.attempts + 1, p.claimed_until = null, p.claim_token = null
             WITH p
             SET p.status = CASE WHEN p.attempts >= $max THEN 'failed' ELSE p.status END
             RETURN p.status AS status"
                .to_string(),
        )
        .param("id", id)
        .param("max", i64::from(max_attempts));
        let mut statuses = self
            .fetch(query, |row| {
                parse::<ReferenceStatus>("reference status", &row.get::<String>("status")?)
            })
            .await
            .map_err(storage_error)?;
        statuses
            .pop()
            .ok_or_else(|| Error::not_found(format!("pending reference {id}")))
    }

    async fn count_entities(&self, repository_id: &str) -> codeweave_core::Result<u64> {
        let query = Query::new(
            "MATCH (e:Entity {repository_id: $repository_id}) RETURN count(e) AS count".into(),
        )
        .param("repository_id", repository_id);
        self.fetch_count(query).await.map_err(storage_error)
    }

    async fn count_relations(&self, repository_id: &str) -> codeweave_core::Result<u64> {
        let query = Query::new(
            "MATCH (:Entity)-[r]->(:Entity)
             WHERE r.repository_id = $repository_id
             RETURN count(r) AS count"
                .into(),
        )
        .param("repository_id", repository_id);
        self.fetch_count(query).await.map_err(storage_error)
    }

    async fn count_pending_references(&self, repository_id: &str) -> codeweave_core::Result<u64> {
        let query = Query::new(
            "MATCH (p:PendingReference {source_repository_id: $repository_id, status: 'pending'})
             RETURN count(p) AS count"
                .into(),
        )
        .param("repository_id", repository_id);
        self.fetch_count(query).await.map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_relation_kind_is_allowed() {
        for kind in [
            RelationKind::Contains,
            RelationKind::Extends,
            RelationKind::Implements,
            RelationKind::Imports,
            RelationKind::Calls,
            RelationKind::Instantiates,
            RelationKind::UsesType,
            RelationKind::References,
        ] {
            assert!(relationship_type(kind).is_ok(), "{kind} rejected");
        }
        assert_eq!(
            relationship_type(RelationKind::UsesType).expect("allowed"),
            "USES_TYPE"
        );
    }

    #[test]
    fn test_timestamps_survive_micros() {
        let now = Utc::now();
        let restored = from_micros(micros(now)).expect("in range");
        assert_eq!(restored.timestamp_micros(), now.timestamp_micros());
    }
}
