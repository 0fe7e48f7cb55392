use super::rows::{
    parse_column, to_i64, FileRow, QueueRow, RepositoryRow, FILE_COLUMNS, REPOSITORY_COLUMNS,
};
use crate::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codeweave_core::{
    Error, FileStatus, FileStatusCounts, FileTask, IndexedFile, QueuedTask, Repository,
    RepositoryStats, RepositoryStatus, Result,
};
use sqlx::postgres::PgQueryResult;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;

/// State store backed by PostgreSQL
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn expect_row(result: PgQueryResult, what: impl FnOnce() -> String) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(Error::not_found(what()));
    }
    Ok(())
}

fn duration_ms(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

/// Put a dequeued entry back, or drop it when a newer entry already waits
async fn release_entry(
    tx: &mut Transaction<'_, Postgres>,
    queue_id: &str,
    delay_ms: i64,
) -> Result<()> {
    let file_id: Option<String> =
        sqlx::query_scalar("SELECT file_id FROM file_queue WHERE id = $1 FOR UPDATE")
            .bind(queue_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| Error::storage(format!("Failed to lock queue entry: {e}")))?;
    let Some(file_id) = file_id else {
        return Ok(());
    };

    let newer_waiting: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM file_queue
            WHERE file_id = $1 AND dequeued_at IS NULL AND id <> $2
        )",
    )
    .bind(&file_id)
    .bind(queue_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| Error::storage(format!("Failed to check waiting entries: {e}")))?;

    if newer_waiting {
        sqlx::query("DELETE FROM file_queue WHERE id = $1")
            .bind(queue_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::storage(format!("Failed to drop queue entry: {e}")))?;
    } else {
        sqlx::query(
            "UPDATE file_queue
             SET dequeued_at = NULL,
                 available_at = NOW() + ($2::bigint * INTERVAL '1 millisecond')
             WHERE id = $1",
        )
        .bind(queue_id)
        .bind(delay_ms)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::storage(format!("Failed to requeue entry: {e}")))?;
    }
    Ok(())
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn upsert_repository(&self, repository: &Repository) -> Result<()> {
        let root_path = repository
            .root_path
            .to_str()
            .ok_or_else(|| Error::storage("Invalid repository path"))?;

        sqlx::query(
            "INSERT INTO repositories (id, name, root_path, branch, depends_on, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                root_path = EXCLUDED.root_path,
                branch = EXCLUDED.branch,
                depends_on = EXCLUDED.depends_on",
        )
        .bind(&repository.id)
        .bind(&repository.name)
        .bind(root_path)
        .bind(&repository.branch)
        .bind(&repository.depends_on)
        .bind(repository.status.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to upsert repository: {e}")))?;
        Ok(())
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to get repository: {e}")))?;
        row.map(RepositoryRow::into_repository).transpose()
    }

    async fn get_repository_by_name(&self, name: &str) -> Result<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to get repository by name: {e}")))?;
        row.map(RepositoryRow::into_repository).transpose()
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories ORDER BY name COLLATE \"C\""
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to list repositories: {e}")))?;
        rows.into_iter().map(RepositoryRow::into_repository).collect()
    }

    async fn update_repository_status(
        &self,
        id: &str,
        status: RepositoryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE repositories SET status = $2, last_error = $3 WHERE id = $1")
                .bind(id)
                .bind(status.to_string())
                .bind(error)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::storage(format!("Failed to update repository status: {e}")))?;
        expect_row(result, || format!("repository {id}"))
    }

    async fn record_repository_stats(
        &self,
        id: &str,
        stats: RepositoryStats,
        status: RepositoryStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE repositories SET
                file_count = $2,
                entity_count = $3,
                relation_count = $4,
                pending_reference_count = $5,
                status = $6,
                last_indexed_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(to_i64(stats.file_count))
        .bind(to_i64(stats.entity_count))
        .bind(to_i64(stats.relation_count))
        .bind(to_i64(stats.pending_reference_count))
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to record repository stats: {e}")))?;
        expect_row(result, || format!("repository {id}"))
    }

    async fn record_reference_counts(
        &self,
        id: &str,
        relation_count: u64,
        pending_reference_count: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE repositories SET relation_count = $2, pending_reference_count = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(to_i64(relation_count))
        .bind(to_i64(pending_reference_count))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to record reference counts: {e}")))?;
        expect_row(result, || format!("repository {id}"))
    }

    async fn mark_repository_scanned(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE repositories SET last_scan_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to mark repository scanned: {e}")))?;
        expect_row(result, || format!("repository {id}"))
    }

    async fn upsert_file(&self, file: &IndexedFile) -> Result<IndexedFile> {
        // A claimed row is left untouched and RETURNING yields nothing
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "INSERT INTO indexed_files (
                id, repository_id, path, checksum, language, file_size, status,
                attempts, embedding_attempts, needs_embedding, last_error, retry_after,
                last_indexed_at, updated_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
             ON CONFLICT (id) DO UPDATE SET
                status = 'pending',
                language = EXCLUDED.language,
                file_size = EXCLUDED.file_size,
                attempts = 0,
                embedding_attempts = 0,
                needs_embedding = FALSE,
                last_error = NULL,
                retry_after = NULL,
                updated_at = NOW()
             WHERE indexed_files.status <> 'indexing'
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(&file.id)
        .bind(&file.repository_id)
        .bind(&file.path)
        .bind(&file.checksum)
        .bind(file.language.to_string())
        .bind(to_i64(file.file_size))
        .bind(file.status.to_string())
        .bind(i32::try_from(file.attempts).unwrap_or(i32::MAX))
        .bind(i32::try_from(file.embedding_attempts).unwrap_or(i32::MAX))
        .bind(file.needs_embedding)
        .bind(&file.last_error)
        .bind(file.retry_after)
        .bind(file.last_indexed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to upsert file: {e}")))?;

        match row {
            Some(row) => row.into_file(),
            None => self
                .get_file(&file.id)
                .await?
                .ok_or_else(|| Error::not_found(format!("file {}", file.id))),
        }
    }

    async fn get_file(&self, id: &str) -> Result<Option<IndexedFile>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM indexed_files WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to get file: {e}")))?;
        row.map(FileRow::into_file).transpose()
    }

    async fn get_file_by_path(
        &self,
        repository_id: &str,
        path: &str,
    ) -> Result<Option<IndexedFile>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM indexed_files WHERE repository_id = $1 AND path = $2"
        ))
        .bind(repository_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to get file by path: {e}")))?;
        row.map(FileRow::into_file).transpose()
    }

    async fn list_files(&self, repository_id: &str) -> Result<Vec<IndexedFile>> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM indexed_files WHERE repository_id = $1 ORDER BY path COLLATE \"C\""
        ))
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to list files: {e}")))?;
        rows.into_iter().map(FileRow::into_file).collect()
    }

    async fn count_files_by_status(&self, repository_id: &str) -> Result<FileStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM indexed_files WHERE repository_id = $1 GROUP BY status",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to count files: {e}")))?;

        let mut counts = FileStatusCounts::default();
        for (status, count) in rows {
            let status: FileStatus = parse_column("file status", &status)?;
            counts.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn claim_file(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE indexed_files SET status = 'indexing', updated_at = NOW()
             WHERE id = $1 AND status <> 'indexing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to claim file: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_file(&self, id: &str, checksum: Option<&str>, file_size: u64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE indexed_files SET
                status = 'indexed',
                checksum = $2,
                file_size = $3,
                attempts = 0,
                embedding_attempts = 0,
                needs_embedding = FALSE,
                last_error = NULL,
                retry_after = NULL,
                last_indexed_at = NOW(),
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(checksum)
        .bind(to_i64(file_size))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to complete file: {e}")))?;
        expect_row(result, || format!("file {id}"))
    }

    async fn fail_file(
        &self,
        id: &str,
        checksum: Option<&str>,
        error: &str,
    ) -> Result<IndexedFile> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "UPDATE indexed_files SET
                status = 'failed',
                attempts = attempts + 1,
                checksum = COALESCE($3, checksum),
                needs_embedding = needs_embedding AND $3 IS NULL,
                last_error = $2,
                retry_after = NULL,
                updated_at = NOW()
             WHERE id = $1
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(id)
        .bind(error)
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to record file failure: {e}")))?;
        row.ok_or_else(|| Error::not_found(format!("file {id}")))?
            .into_file()
    }

    async fn mark_needs_embedding(
        &self,
        id: &str,
        checksum: Option<&str>,
        error: &str,
    ) -> Result<IndexedFile> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "UPDATE indexed_files SET
                status = 'failed',
                checksum = $2,
                needs_embedding = TRUE,
                embedding_attempts = embedding_attempts + 1,
                last_error = $3,
                retry_after = NULL,
                updated_at = NOW()
             WHERE id = $1
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(id)
        .bind(checksum)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to record embedding failure: {e}")))?;
        row.ok_or_else(|| Error::not_found(format!("file {id}")))?
            .into_file()
    }

    async fn schedule_retry(&self, id: &str, retry_after: Option<DateTime<Utc>>) -> Result<()> {
        let result = sqlx::query("UPDATE indexed_files SET retry_after = $2 WHERE id = $1")
            .bind(id)
            .bind(retry_after)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to schedule retry: {e}")))?;
        expect_row(result, || format!("file {id}"))
    }

    async fn tombstone_file(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE indexed_files SET
                status = 'deleted',
                checksum = NULL,
                needs_embedding = FALSE,
                last_error = NULL,
                retry_after = NULL,
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to tombstone file: {e}")))?;
        expect_row(result, || format!("file {id}"))
    }

    async fn reset_failed(&self, repository_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE indexed_files SET
                status = 'pending',
                attempts = 0,
                embedding_attempts = 0,
                last_error = NULL,
                retry_after = NULL,
                updated_at = NOW()
             WHERE repository_id = $1 AND status = 'failed'",
        )
        .bind(repository_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to reset failed files: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn retryable_files(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<IndexedFile>> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM indexed_files
             WHERE status = 'failed' AND retry_after IS NOT NULL AND retry_after <= $1
             ORDER BY retry_after, id COLLATE \"C\"
             LIMIT $2"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to list retryable files: {e}")))?;
        rows.into_iter().map(FileRow::into_file).collect()
    }

    async fn recover_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE indexed_files SET status = 'pending', updated_at = NOW()
             WHERE status = 'indexing' AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to recover stale claims: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn enqueue(&self, task: &FileTask) -> Result<bool> {
        // xmax is zero only for freshly inserted tuples
        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO file_queue (id, repository_id, file_id, path, change)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (file_id) WHERE dequeued_at IS NULL
             DO UPDATE SET change = EXCLUDED.change
             RETURNING (xmax = 0)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&task.repository_id)
        .bind(&task.file_id)
        .bind(&task.path)
        .bind(task.change.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to enqueue task: {e}")))?;
        Ok(inserted)
    }

    async fn dequeue_next(&self) -> Result<Option<QueuedTask>> {
        let row = sqlx::query_as::<_, QueueRow>(
            "UPDATE file_queue SET dequeued_at = NOW()
             WHERE id = (
                SELECT q.id FROM file_queue q
                WHERE q.dequeued_at IS NULL
                  AND q.available_at <= NOW()
                  AND NOT EXISTS (
                      SELECT 1 FROM indexed_files f
                      WHERE f.id = q.file_id AND f.status = 'indexing'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM file_queue d
                      WHERE d.file_id = q.file_id AND d.dequeued_at IS NOT NULL
                  )
                ORDER BY q.available_at ASC, q.enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
             )
             RETURNING id, repository_id, file_id, path, change, enqueued_at",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to dequeue task: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        debug!(queue_id = %row.id, path = %row.path, "Dequeued file task");
        Ok(Some(QueuedTask {
            task: FileTask {
                repository_id: row.repository_id,
                file_id: row.file_id,
                path: row.path,
                change: parse_column("change kind", &row.change)?,
            },
            queue_id: row.id,
            enqueued_at: row.enqueued_at,
        }))
    }

    async fn mark_done(&self, queue_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_queue WHERE id = $1")
            .bind(queue_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to mark task done: {e}")))?;
        Ok(())
    }

    async fn requeue(&self, queue_id: &str, delay: Duration) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {e}")))?;
        release_entry(&mut tx, queue_id, duration_ms(delay)).await?;
        tx.commit()
            .await
            .map_err(|e| Error::storage(format!("Failed to commit transaction: {e}")))
    }

    async fn queue_len(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM file_queue WHERE dequeued_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::storage(format!("Failed to count queue: {e}")))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn recover_stale_dequeues(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {e}")))?;

        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM file_queue WHERE dequeued_at < $1 ORDER BY dequeued_at",
        )
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::storage(format!("Failed to find stale dequeues: {e}")))?;

        for queue_id in &stale {
            release_entry(&mut tx, queue_id, 0).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::storage(format!("Failed to commit transaction: {e}")))?;
        Ok(stale.len() as u64)
    }

    async fn requeue_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO file_queue (id, repository_id, file_id, path, change)
             SELECT gen_random_uuid()::text, f.repository_id, f.id, f.path,
                    CASE WHEN f.checksum IS NULL THEN 'create' ELSE 'update' END
             FROM indexed_files f
             WHERE f.status = 'pending'
               AND NOT EXISTS (SELECT 1 FROM file_queue q WHERE q.file_id = f.id)
             ON CONFLICT DO NOTHING",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to requeue orphaned files: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
