//! Repository and file state tracked by the state store

use crate::entities::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Stable repository id derived from the configured repository name
pub fn repository_id_for(name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("codeweave:repository:{name}").as_bytes())
        .to_string()
}

/// Stable file id derived from its repository and relative path
pub fn file_id_for(repository_id: &str, path: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("codeweave:file:{repository_id}:{path}").as_bytes(),
    )
    .to_string()
}

/// Lifecycle status of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RepositoryStatus {
    Pending,
    Indexing,
    Watching,
    Failed,
}

/// Aggregate counters for one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub file_count: u64,
    pub entity_count: u64,
    pub relation_count: u64,
    pub pending_reference_count: u64,
}

/// An indexed repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub root_path: PathBuf,
    pub branch: String,
    pub depends_on: Vec<String>,
    pub status: RepositoryStatus,
    pub stats: RepositoryStats,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Repository {
    /// New repository in `pending` state with an id derived from `name`
    pub fn new(name: impl Into<String>, root_path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: repository_id_for(&name),
            name,
            root_path: root_path.into(),
            branch: branch.into(),
            depends_on: Vec::new(),
            status: RepositoryStatus::Pending,
            stats: RepositoryStats::default(),
            last_scan_at: None,
            last_indexed_at: None,
            last_error: None,
        }
    }
}

/// Status of one tracked file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Indexing,
    Indexed,
    Failed,
    /// Tombstone for a file removed from disk
    Deleted,
}

/// A file tracked inside a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub id: String,
    pub repository_id: String,
    /// Path relative to the repository root, `/` separated
    pub path: String,
    /// Content fingerprint of the last version an attempt read, successful or not
    pub checksum: Option<String>,
    pub language: Language,
    pub file_size: u64,
    pub status: FileStatus,
    pub attempts: u32,
    pub embedding_attempts: u32,
    /// Extraction succeeded but vectors are missing
    pub needs_embedding: bool,
    pub last_error: Option<String>,
    /// Earliest time the retry loop may re-enqueue a failed file
    pub retry_after: Option<DateTime<Utc>>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IndexedFile {
    /// A newly discovered file, not yet indexed
    pub fn discovered(repository_id: &str, path: &str, file_size: u64) -> Self {
        Self {
            id: file_id_for(repository_id, path),
            repository_id: repository_id.to_string(),
            path: path.to_string(),
            checksum: None,
            language: Language::from_path(path),
            file_size,
            status: FileStatus::Pending,
            attempts: 0,
            embedding_attempts: 0,
            needs_embedding: false,
            last_error: None,
            retry_after: None,
            last_indexed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.status == FileStatus::Deleted
    }
}

/// Per-status file counts for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStatusCounts {
    pub pending: u64,
    pub indexing: u64,
    pub indexed: u64,
    pub failed: u64,
    pub deleted: u64,
}

impl FileStatusCounts {
    pub fn add(&mut self, status: FileStatus, count: u64) {
        match status {
            FileStatus::Pending => self.pending += count,
            FileStatus::Indexing => self.indexing += count,
            FileStatus::Indexed => self.indexed += count,
            FileStatus::Failed => self.failed += count,
            FileStatus::Deleted => self.deleted += count,
        }
    }

    /// Files that still exist on disk
    pub fn live(&self) -> u64 {
        self.pending + self.indexing + self.indexed + self.failed
    }
}

/// What happened to a file on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A unit of work for the indexing pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    pub repository_id: String,
    pub file_id: String,
    pub path: String,
    pub change: ChangeKind,
}

impl FileTask {
    pub fn new(repository_id: &str, path: &str, change: ChangeKind) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            file_id: file_id_for(repository_id, path),
            path: path.to_string(),
            change,
        }
    }
}

/// A task taken off the durable queue; invisible to other workers until
/// marked done or requeued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub queue_id: String,
    pub task: FileTask,
    pub enqueued_at: DateTime<Utc>,
}
