//! Row types and conversions for PostgreSQL storage

use crate::StorageError;
use chrono::{DateTime, Utc};
use codeweave_core::{
    CodeEntity, CodeRelation, IndexedFile, PendingReference, Repository, RepositoryStats, Result,
    SourceSpan,
};
use std::path::PathBuf;
use std::str::FromStr;

/// Parse a text column into a strum-backed enum
pub(crate) fn parse_column<T: FromStr>(column: &str, value: &str) -> Result<T> {
    T::from_str(value).map_err(|_| {
        StorageError::CorruptRow(format!("unexpected {column} value '{value}'")).into()
    })
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_usize(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

/// Clamp a count or line number into an INTEGER column
pub(crate) fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(sqlx::FromRow)]
pub(crate) struct RepositoryRow {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub branch: String,
    pub depends_on: Vec<String>,
    pub status: String,
    pub file_count: i64,
    pub entity_count: i64,
    pub relation_count: i64,
    pub pending_reference_count: i64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RepositoryRow {
    pub fn into_repository(self) -> Result<Repository> {
        Ok(Repository {
            id: self.id,
            name: self.name,
            root_path: PathBuf::from(self.root_path),
            branch: self.branch,
            depends_on: self.depends_on,
            status: parse_column("repository status", &self.status)?,
            stats: RepositoryStats {
                file_count: to_u64(self.file_count),
                entity_count: to_u64(self.entity_count),
                relation_count: to_u64(self.relation_count),
                pending_reference_count: to_u64(self.pending_reference_count),
            },
            last_scan_at: self.last_scan_at,
            last_indexed_at: self.last_indexed_at,
            last_error: self.last_error,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    pub id: String,
    pub repository_id: String,
    pub path: String,
    pub checksum: Option<String>,
    pub language: String,
    pub file_size: i64,
    pub status: String,
    pub attempts: i32,
    pub embedding_attempts: i32,
    pub needs_embedding: bool,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl FileRow {
    pub fn into_file(self) -> Result<IndexedFile> {
        Ok(IndexedFile {
            id: self.id,
            repository_id: self.repository_id,
            path: self.path,
            checksum: self.checksum,
            language: parse_column("language", &self.language)?,
            file_size: to_u64(self.file_size),
            status: parse_column("file status", &self.status)?,
            attempts: to_u32(self.attempts),
            embedding_attempts: to_u32(self.embedding_attempts),
            needs_embedding: self.needs_embedding,
            last_error: self.last_error,
            retry_after: self.retry_after,
            last_indexed_at: self.last_indexed_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EntityRow {
    pub id: String,
    pub repository_id: String,
    pub file_id: String,
    pub qualified_name: String,
    pub simple_name: String,
    pub kind: String,
    pub language: String,
    pub start_line: i32,
    pub end_line: i32,
    pub start_column: i32,
    pub end_column: i32,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub source_text: Option<String>,
    pub visibility: String,
    pub vector_id: Option<String>,
}

impl EntityRow {
    pub fn into_entity(self) -> Result<CodeEntity> {
        Ok(CodeEntity {
            id: self.id,
            repository_id: self.repository_id,
            file_id: self.file_id,
            qualified_name: self.qualified_name,
            simple_name: self.simple_name,
            kind: parse_column("entity kind", &self.kind)?,
            language: parse_column("language", &self.language)?,
            span: SourceSpan::new(
                to_usize(self.start_line),
                to_usize(self.end_line),
                to_usize(self.start_column),
                to_usize(self.end_column),
            ),
            signature: self.signature,
            docstring: self.docstring,
            source_text: self.source_text,
            visibility: parse_column("visibility", &self.visibility)?,
            vector_id: self.vector_id,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct RelationRow {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub kind: String,
    pub repository_id: String,
    pub is_cross_repository: bool,
    pub line_number: Option<i32>,
}

impl RelationRow {
    pub fn into_relation(self) -> Result<CodeRelation> {
        Ok(CodeRelation {
            id: self.id,
            source_id: self.source_id,
            target_id: self.target_id,
            kind: parse_column("relation kind", &self.kind)?,
            repository_id: self.repository_id,
            is_cross_repository: self.is_cross_repository,
            line_number: self.line_number.map(to_usize),
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PendingReferenceRow {
    pub id: String,
    pub source_entity_id: String,
    pub source_qualified_name: String,
    pub source_repository_id: String,
    pub target_qualified_name: String,
    pub kind: String,
    pub status: String,
    pub attempts: i32,
    pub resolved_target_id: Option<String>,
    pub line_number: Option<i32>,
    pub receiver_expr: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingReferenceRow {
    pub fn into_reference(self) -> Result<PendingReference> {
        Ok(PendingReference {
            id: self.id,
            source_entity_id: self.source_entity_id,
            source_qualified_name: self.source_qualified_name,
            source_repository_id: self.source_repository_id,
            target_qualified_name: self.target_qualified_name,
            kind: parse_column("relation kind", &self.kind)?,
            status: parse_column("reference status", &self.status)?,
            attempts: to_u32(self.attempts),
            resolved_target_id: self.resolved_target_id,
            line_number: self.line_number.map(to_usize),
            receiver_expr: self.receiver_expr,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct QueueRow {
    pub id: String,
    pub repository_id: String,
    pub file_id: String,
    pub path: String,
    pub change: String,
    pub enqueued_at: DateTime<Utc>,
}

pub(crate) const REPOSITORY_COLUMNS: &str = "id, name, root_path, branch, depends_on, status, \
    file_count, entity_count, relation_count, pending_reference_count, last_scan_at, \
    last_indexed_at, last_error";

pub(crate) const FILE_COLUMNS: &str = "id, repository_id, path, checksum, language, file_size, \
    status, attempts, embedding_attempts, needs_embedding, last_error, retry_after, \
    last_indexed_at, updated_at";

pub(crate) const ENTITY_COLUMNS: &str = "id, repository_id, file_id, qualified_name, \
    simple_name, kind, language, start_line, end_line, start_column, end_column, signature, \
    docstring, source_text, visibility, vector_id";

pub(crate) const RELATION_COLUMNS: &str =
    "id, source_id, target_id, kind, repository_id, is_cross_repository, line_number";

pub(crate) const REFERENCE_COLUMNS: &str = "id, source_entity_id, source_qualified_name, \
    source_repository_id, target_qualified_name, kind, status, attempts, resolved_target_id, \
    line_number, receiver_expr, created_at";

#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::{FileStatus, Language};

    #[test]
    fn test_file_row_converts() {
        let row = FileRow {
            id: "f".to_string(),
            repository_id: "r".to_string(),
            path: "a.py".to_string(),
            checksum: None,
            language: "python".to_string(),
            file_size: 12,
            status: "needs_work".to_string(),
            attempts: 0,
            embedding_attempts: 0,
            needs_embedding: false,
            last_error: None,
            retry_after: None,
            last_indexed_at: None,
            updated_at: Utc::now(),
        };
        assert!(row.into_file().is_err());

        let row = FileRow {
            id: "f".to_string(),
            repository_id: "r".to_string(),
            path: "a.py".to_string(),
            checksum: Some("abc".to_string()),
            language: "python".to_string(),
            file_size: 12,
            status: "indexed".to_string(),
            attempts: 2,
            embedding_attempts: 1,
            needs_embedding: true,
            last_error: None,
            retry_after: None,
            last_indexed_at: None,
            updated_at: Utc::now(),
        };
        let file = row.into_file().expect("valid row");
        assert_eq!(file.status, FileStatus::Indexed);
        assert_eq!(file.language, Language::Python);
        assert_eq!(file.attempts, 2);
    }
}
