//! Storage port contract and backends
//!
//! The indexer talks to storage exclusively through three traits:
//!
//! - [`StateStore`]: repositories, tracked files, file claims and the durable
//!   file-task queue
//! - [`RelationGraph`]: entities, relations and pending references
//! - [`VectorStore`]: entity embeddings and nearest-neighbour search
//!
//! Every backend produces the same observable results for the same call
//! sequence. Backends are picked once at startup by [`create_storage`].

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod error;
mod factory;
pub mod memory;
pub mod neo4j;
pub mod postgres;
pub mod qdrant;

pub use error::StorageError;
pub use factory::{create_storage, StorageHandles};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codeweave_core::{
    CodeEntity, CodeRelation, FileStatusCounts, FileTask, IndexedFile, PendingReference,
    QueuedTask, ReferenceStatus, Repository, RepositoryStats, RepositoryStatus, Result,
    ScoredVector, SearchFilters, VectorRecord,
};
use std::time::Duration;

/// Deterministic vector id for an entity; one vector per entity
pub fn vector_id_for(entity_id: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, entity_id.as_bytes()).to_string()
}

/// Repository and file state, plus the durable file-task queue
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a repository or update its configured identity (path, branch,
    /// dependencies); status and statistics of an existing row are kept
    async fn upsert_repository(&self, repository: &Repository) -> Result<()>;

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>>;

    async fn get_repository_by_name(&self, name: &str) -> Result<Option<Repository>>;

    /// All repositories ordered by name
    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    async fn update_repository_status(
        &self,
        id: &str,
        status: RepositoryStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Store freshly recounted statistics and stamp `last_indexed_at`
    async fn record_repository_stats(
        &self,
        id: &str,
        stats: RepositoryStats,
        status: RepositoryStatus,
    ) -> Result<()>;

    /// Store only the relation and pending-reference counters
    async fn record_reference_counts(
        &self,
        id: &str,
        relation_count: u64,
        pending_reference_count: u64,
    ) -> Result<()>;

    async fn mark_repository_scanned(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Register a discovered or changed file
    ///
    /// A new file is inserted as given. An existing file that is not currently
    /// claimed goes back to `pending` with its attempt counters reset. A
    /// claimed file is left alone; the queued task will be picked up after
    /// the current attempt.
    ///
    /// # Returns
    /// The stored row after the update
    async fn upsert_file(&self, file: &IndexedFile) -> Result<IndexedFile>;

    async fn get_file(&self, id: &str) -> Result<Option<IndexedFile>>;

    async fn get_file_by_path(&self, repository_id: &str, path: &str)
        -> Result<Option<IndexedFile>>;

    /// All files of a repository ordered by path, tombstones included
    async fn list_files(&self, repository_id: &str) -> Result<Vec<IndexedFile>>;

    async fn count_files_by_status(&self, repository_id: &str) -> Result<FileStatusCounts>;

    /// Atomically move a file into `indexing`
    ///
    /// # Returns
    /// `false` when the file is unknown or already claimed
    async fn claim_file(&self, id: &str) -> Result<bool>;

    /// Mark a claimed file `indexed`, resetting its attempt counters
    async fn complete_file(&self, id: &str, checksum: Option<&str>, file_size: u64) -> Result<()>;

    /// Record a failed attempt: increments `attempts`, sets status `failed`
    /// and clears any scheduled retry
    ///
    /// `checksum` is the fingerprint of the content the attempt read, when it
    /// got that far. It replaces the stored one and clears `needs_embedding`,
    /// so a later edit of the file is seen as a change by the scanner.
    ///
    /// # Returns
    /// The updated row
    async fn fail_file(&self, id: &str, checksum: Option<&str>, error: &str)
        -> Result<IndexedFile>;

    /// Record that entities are stored but embedding failed
    ///
    /// Increments `embedding_attempts`, keeps `attempts`, stores the checksum of
    /// the extracted content and sets status `failed` with `needs_embedding`.
    async fn mark_needs_embedding(
        &self,
        id: &str,
        checksum: Option<&str>,
        error: &str,
    ) -> Result<IndexedFile>;

    /// Set or clear the time after which the retry loop may re-enqueue a failed file
    async fn schedule_retry(&self, id: &str, retry_after: Option<DateTime<Utc>>) -> Result<()>;

    /// Tombstone a file removed from disk
    async fn tombstone_file(&self, id: &str) -> Result<()>;

    /// Move failed files of a repository back to `pending` with counters reset
    ///
    /// # Returns
    /// Number of files reset
    async fn reset_failed(&self, repository_id: &str) -> Result<u64>;

    /// Failed files whose scheduled retry time has passed, oldest first
    async fn retryable_files(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<IndexedFile>>;

    /// Un-claim files left in `indexing` since before `older_than`
    ///
    /// # Returns
    /// Number of files moved back to `pending`
    async fn recover_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Put a task on the queue
    ///
    /// At most one waiting entry exists per file; enqueueing a file that is
    /// already waiting replaces its change kind.
    ///
    /// # Returns
    /// `true` when a new entry was created
    async fn enqueue(&self, task: &FileTask) -> Result<bool>;

    /// Take the oldest available task
    ///
    /// The entry stays invisible to other callers until [`StateStore::mark_done`]
    /// or [`StateStore::requeue`]. Entries whose file is currently claimed are
    /// skipped.
    async fn dequeue_next(&self) -> Result<Option<QueuedTask>>;

    async fn mark_done(&self, queue_id: &str) -> Result<()>;

    /// Make a dequeued entry available again after `delay`
    ///
    /// Dropped instead when a newer entry for the same file is already waiting.
    async fn requeue(&self, queue_id: &str, delay: Duration) -> Result<()>;

    /// Number of waiting entries
    async fn queue_len(&self) -> Result<u64>;

    /// Return entries dequeued before `older_than` to the queue
    async fn recover_stale_dequeues(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Enqueue every `pending` file that has no waiting or in-flight entry
    async fn requeue_orphans(&self) -> Result<u64>;

    /// Release connections
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Entity, relation and pending-reference storage
#[async_trait]
pub trait RelationGraph: Send + Sync {
    /// Store entities as given
    ///
    /// # Returns
    /// The entity ids, in input order
    async fn add_entities(&self, entities: &[CodeEntity]) -> Result<Vec<String>>;

    async fn get_entity(&self, id: &str) -> Result<Option<CodeEntity>>;

    /// Entities whose qualified name equals `qualified_name`, ordered by id
    async fn find_entities_by_name(&self, qualified_name: &str) -> Result<Vec<CodeEntity>>;

    /// Entities whose qualified name is `suffix` or ends with `.{suffix}`,
    /// ordered by qualified name then id
    async fn find_entities_by_suffix(&self, suffix: &str, limit: usize)
        -> Result<Vec<CodeEntity>>;

    /// Entities of a file ordered by start line then qualified name
    async fn entities_for_file(&self, file_id: &str) -> Result<Vec<CodeEntity>>;

    /// Delete every entity of a file
    ///
    /// Cascades to relations touching a deleted entity and to pending
    /// references sourced at one. Resolved references that pointed at a
    /// deleted entity go back to `pending` so they can bind to its successor.
    ///
    /// # Returns
    /// Number of entities deleted
    async fn delete_entities_for_file(&self, file_id: &str) -> Result<u64>;

    /// Replace the entities of a file with a fresh extraction
    ///
    /// Backends with transactions apply the delete and insert atomically.
    ///
    /// # Returns
    /// Number of entities deleted
    async fn replace_file_entities(&self, file_id: &str, entities: &[CodeEntity]) -> Result<u64> {
        let deleted = self.delete_entities_for_file(file_id).await?;
        self.add_entities(entities).await?;
        Ok(deleted)
    }

    async fn set_vector_id(&self, entity_id: &str, vector_id: &str) -> Result<()>;

    /// Store a relation; storing the same (source, target, kind) again returns
    /// the existing id
    async fn add_relation(&self, relation: &CodeRelation) -> Result<String>;

    /// Outgoing relations ordered by kind then target id
    async fn relations_from(&self, entity_id: &str) -> Result<Vec<CodeRelation>>;

    /// Incoming relations ordered by kind then source id
    async fn relations_to(&self, entity_id: &str) -> Result<Vec<CodeRelation>>;

    async fn add_pending_reference(&self, reference: &PendingReference) -> Result<String>;

    async fn get_pending_reference(&self, id: &str) -> Result<Option<PendingReference>>;

    /// Claim up to `limit` pending references, oldest first
    ///
    /// Claimed references are hidden from other callers for `lease`, or
    /// until resolved or charged a failed attempt.
    async fn claim_pending_references(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PendingReference>>;

    /// Mark a reference resolved to `target_id`
    async fn resolve_pending_reference(&self, id: &str, target_id: &str) -> Result<()>;

    /// Charge one failed resolution attempt
    ///
    /// # Returns
    /// `Failed` once the attempt count reaches `max_attempts`, `Pending` otherwise
    async fn record_failed_attempt(&self, id: &str, max_attempts: u32) -> Result<ReferenceStatus>;

    async fn count_entities(&self, repository_id: &str) -> Result<u64>;

    /// Relations whose source entity belongs to the repository
    async fn count_relations(&self, repository_id: &str) -> Result<u64>;

    /// References of the repository still in `pending`
    async fn count_pending_references(&self, repository_id: &str) -> Result<u64>;

    /// Release connections
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Embedding storage and similarity search
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create collections or indexes for vectors of `dimension`
    async fn ensure_ready(&self, dimension: usize) -> Result<()>;

    /// Store or overwrite vectors, one per entity
    ///
    /// # Returns
    /// Vector ids in input order (see [`vector_id_for`])
    async fn add_vectors(&self, records: &[VectorRecord]) -> Result<Vec<String>>;

    /// Nearest neighbours by cosine similarity
    ///
    /// # Returns
    /// At most `limit` hits passing `filters`, ordered by decreasing score then
    /// entity id
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredVector>>;

    /// Delete every vector of a file
    ///
    /// # Returns
    /// Number of vectors deleted
    async fn delete_vectors_for_file(&self, file_id: &str) -> Result<u64>;

    /// Release connections
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sort hits by decreasing score, then entity id, and keep `limit`
pub(crate) fn rank_hits(mut hits: Vec<ScoredVector>, limit: usize) -> Vec<ScoredVector> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    hits.truncate(limit);
    hits
}

/// `now + delay`, saturating far in the future for absurd delays
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650));
    now + delta
}

/// Whether `qualified_name` is `suffix` or ends with `.{suffix}`
pub(crate) fn matches_suffix(qualified_name: &str, suffix: &str) -> bool {
    qualified_name == suffix
        || qualified_name
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_suffix() {
        assert!(matches_suffix("a.foo", "foo"));
        assert!(matches_suffix("foo", "foo"));
        assert!(matches_suffix("pkg.a.foo", "a.foo"));
        assert!(!matches_suffix("a.barfoo", "foo"));
        assert!(!matches_suffix("a.foo.bar", "foo"));
    }

    #[test]
    fn test_vector_id_is_deterministic() {
        assert_eq!(vector_id_for("e1"), vector_id_for("e1"));
        assert_ne!(vector_id_for("e1"), vector_id_for("e2"));
    }
}
