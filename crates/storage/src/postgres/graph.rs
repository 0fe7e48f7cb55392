use super::rows::{
    parse_column, to_i32, EntityRow, PendingReferenceRow, RelationRow, ENTITY_COLUMNS,
    REFERENCE_COLUMNS, RELATION_COLUMNS,
};
use crate::RelationGraph;
use async_trait::async_trait;
use codeweave_core::{
    CodeEntity, CodeRelation, Error, PendingReference, ReferenceStatus, Result,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

/// Relation graph backed by PostgreSQL tables
pub struct PostgresRelationGraph {
    pool: PgPool,
}

impl PostgresRelationGraph {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {e}")))
    }
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|e| Error::storage(format!("Failed to commit transaction: {e}")))
}

/// Escape `%`, `_` and `\` for a LIKE pattern
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

async fn insert_entities(
    tx: &mut Transaction<'_, Postgres>,
    entities: &[CodeEntity],
) -> Result<()> {
    for entity in entities {
        sqlx::query(
            "INSERT INTO entities (
                id, repository_id, file_id, qualified_name, simple_name, kind, language,
                start_line, end_line, start_column, end_column, signature, docstring,
                source_text, visibility, vector_id
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT (id) DO UPDATE SET
                file_id = EXCLUDED.file_id,
                qualified_name = EXCLUDED.qualified_name,
                simple_name = EXCLUDED.simple_name,
                kind = EXCLUDED.kind,
                start_line = EXCLUDED.start_line,
                end_line = EXCLUDED.end_line,
                start_column = EXCLUDED.start_column,
                end_column = EXCLUDED.end_column,
                signature = EXCLUDED.signature,
                docstring = EXCLUDED.docstring,
                source_text = EXCLUDED.source_text,
                visibility = EXCLUDED.visibility,
                vector_id = EXCLUDED.vector_id",
        )
        .bind(&entity.id)
        .bind(&entity.repository_id)
        .bind(&entity.file_id)
        .bind(&entity.qualified_name)
        .bind(&entity.simple_name)
        .bind(entity.kind.to_string())
        .bind(entity.language.to_string())
        .bind(to_i32(entity.span.start_line))
        .bind(to_i32(entity.span.end_line))
        .bind(to_i32(entity.span.start_column))
        .bind(to_i32(entity.span.end_column))
        .bind(&entity.signature)
        .bind(&entity.docstring)
        .bind(&entity.source_text)
        .bind(entity.visibility.to_string())
        .bind(&entity.vector_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::storage(format!("Failed to insert entity: {e}")))?;
    }
    Ok(())
}

/// Revert references bound to the file's entities, then delete the entities.
/// Relations and references sourced at them go with the foreign-key cascade.
async fn delete_file_entities(tx: &mut Transaction<'_, Postgres>, file_id: &str) -> Result<u64> {
    sqlx::query(
        "UPDATE pending_references SET
            status = 'pending',
            attempts = 0,
            resolved_target_id = NULL,
            claimed_until = NULL
         WHERE status = 'resolved'
           AND resolved_target_id IN (SELECT id FROM entities WHERE file_id = $1)",
    )
    .bind(file_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::storage(format!("Failed to revert resolved references: {e}")))?;

    let result = sqlx::query("DELETE FROM entities WHERE file_id = $1")
        .bind(file_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::storage(format!("Failed to delete entities: {e}")))?;
    Ok(result.rows_affected())
}

#[async_trait]
impl RelationGraph for PostgresRelationGraph {
    async fn add_entities(&self, entities: &[CodeEntity]) -> Result<Vec<String>> {
        let mut tx = self.begin().await?;
        insert_entities(&mut tx, entities).await?;
        commit(tx).await?;
        Ok(entities.iter().map(|e| e.id.clone()).collect())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<CodeEntity>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to get entity: {e}")))?;
        row.map(EntityRow::into_entity).transpose()
    }

    async fn find_entities_by_name(&self, qualified_name: &str) -> Result<Vec<CodeEntity>> {
        let rows = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE qualified_name = $1
             ORDER BY id COLLATE \"C\""
        ))
        .bind(qualified_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to find entities by name: {e}")))?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn find_entities_by_suffix(
        &self,
        suffix: &str,
        limit: usize,
    ) -> Result<Vec<CodeEntity>> {
        let rows = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE qualified_name = $1 OR qualified_name LIKE $2 ESCAPE '\\'
             ORDER BY qualified_name COLLATE \"C\", id COLLATE \"C\"
             LIMIT $3"
        ))
        .bind(suffix)
        .bind(format!("%.{}", escape_like(suffix)))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to find entities by suffix: {e}")))?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn entities_for_file(&self, file_id: &str) -> Result<Vec<CodeEntity>> {
        let rows = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE file_id = $1
             ORDER BY start_line, qualified_name COLLATE \"C\""
        ))
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to list file entities: {e}")))?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn delete_entities_for_file(&self, file_id: &str) -> Result<u64> {
        let mut tx = self.begin().await?;
        let deleted = delete_file_entities(&mut tx, file_id).await?;
        commit(tx).await?;
        Ok(deleted)
    }

    async fn replace_file_entities(&self, file_id: &str, entities: &[CodeEntity]) -> Result<u64> {
        let mut tx = self.begin().await?;
        let deleted = delete_file_entities(&mut tx, file_id).await?;
        insert_entities(&mut tx, entities).await?;
        commit(tx).await?;
        Ok(deleted)
    }

    async fn set_vector_id(&self, entity_id: &str, vector_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE entities SET vector_id = $2 WHERE id = $1")
            .bind(entity_id)
            .bind(vector_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to set vector id: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("entity {entity_id}")));
        }
        Ok(())
    }

    async fn add_relation(&self, relation: &CodeRelation) -> Result<String> {
        let id: String = sqlx::query_scalar(
            "INSERT INTO relations (
                id, source_id, target_id, kind, repository_id, is_cross_repository, line_number
             ) VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (source_id, target_id, kind) DO UPDATE SET kind = EXCLUDED.kind
             RETURNING id",
        )
        .bind(&relation.id)
        .bind(&relation.source_id)
        .bind(&relation.target_id)
        .bind(relation.kind.to_string())
        .bind(&relation.repository_id)
        .bind(relation.is_cross_repository)
        .bind(relation.line_number.map(to_i32))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to add relation: {e}")))?;
        Ok(id)
    }

    async fn relations_from(&self, entity_id: &str) -> Result<Vec<CodeRelation>> {
        let rows = sqlx::query_as::<_, RelationRow>(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations
             WHERE source_id = $1
             ORDER BY kind COLLATE \"C\", target_id COLLATE \"C\""
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to list outgoing relations: {e}")))?;
        rows.into_iter().map(RelationRow::into_relation).collect()
    }

    async fn relations_to(&self, entity_id: &str) -> Result<Vec<CodeRelation>> {
        let rows = sqlx::query_as::<_, RelationRow>(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations
             WHERE target_id = $1
             ORDER BY kind COLLATE \"C\", source_id COLLATE \"C\""
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to list incoming relations: {e}")))?;
        rows.into_iter().map(RelationRow::into_relation).collect()
    }

    async fn add_pending_reference(&self, reference: &PendingReference) -> Result<String> {
        sqlx::query(
            "INSERT INTO pending_references (
                id, source_entity_id, source_qualified_name, source_repository_id,
                target_qualified_name, kind, status, attempts, resolved_target_id,
                line_number, receiver_expr, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&reference.id)
        .bind(&reference.source_entity_id)
        .bind(&reference.source_qualified_name)
        .bind(&reference.source_repository_id)
        .bind(&reference.target_qualified_name)
        .bind(reference.kind.to_string())
        .bind(reference.status.to_string())
        .bind(i32::try_from(reference.attempts).unwrap_or(i32::MAX))
        .bind(&reference.resolved_target_id)
        .bind(reference.line_number.map(to_i32))
        .bind(&reference.receiver_expr)
        .bind(reference.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to add pending reference: {e}")))?;
        Ok(reference.id.clone())
    }

    async fn get_pending_reference(&self, id: &str) -> Result<Option<PendingReference>> {
        let row = sqlx::query_as::<_, PendingReferenceRow>(&format!(
            "SELECT {REFERENCE_COLUMNS} FROM pending_references WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to get pending reference: {e}")))?;
        row.map(PendingReferenceRow::into_reference).transpose()
    }

    async fn claim_pending_references(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PendingReference>> {
        let rows = sqlx::query_as::<_, PendingReferenceRow>(&format!(
            "UPDATE pending_references
             SET claimed_until = NOW() + ($2::bigint * INTERVAL '1 millisecond')
             WHERE id IN (
                SELECT id FROM pending_references
                WHERE status = 'pending'
                  AND (claimed_until IS NULL OR claimed_until <= NOW())
                ORDER BY created_at, id COLLATE \"C\"
                LIMIT $1
                FOR UPDATE SKIP LOCKED
             )
             RETURNING {REFERENCE_COLUMNS}"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to claim pending references: {e}")))?;

        let mut claimed = rows
            .into_iter()
            .map(PendingReferenceRow::into_reference)
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn resolve_pending_reference(&self, id: &str, target_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE pending_references
             SET status = 'resolved', resolved_target_id = $2, claimed_until = NULL
             WHERE id = $1",
        )
        .bind(id)
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to resolve pending reference: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("pending reference {id}")));
        }
        Ok(())
    }

    async fn record_failed_attempt(&self, id: &str, max_attempts: u32) -> Result<ReferenceStatus> {
        let status: Option<String> = sqlx::query_scalar(
            "UPDATE pending_references SET
                attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= $2 THEN 'failed' ELSE status END,
                claimed_until = NULL
             WHERE id = $1
             RETURNING status",
        )
        .bind(id)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to record failed attempt: {e}")))?;
        let status = status.ok_or_else(|| Error::not_found(format!("pending reference {id}")))?;
        parse_column("reference status", &status)
    }

    async fn count_entities(&self, repository_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE repository_id = $1")
            .bind(repository_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to count entities: {e}")))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn count_relations(&self, repository_id: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM relations WHERE repository_id = $1")
                .bind(repository_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::storage(format!("Failed to count relations: {e}")))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn count_pending_references(&self, repository_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_references
             WHERE source_repository_id = $1 AND status = 'pending'",
        )
        .bind(repository_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to count pending references: {e}")))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
