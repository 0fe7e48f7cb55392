//! Per-file indexing pipeline
//!
//! Processing a [`FileTask`] runs under an exclusive claim on the file:
//!
//! 1. **Claim**: `pending`/`indexed`/`failed` → `indexing`, or give way to
//!    whoever holds the claim
//! 2. **Extract**: read the file, fingerprint it and run the extractor
//! 3. **Replace**: swap the file's previous entities for the fresh ones
//! 4. **Relate**: store in-file relations, bind references whose target is
//!    already indexed and park the rest as pending references
//! 5. **Embed**: one vector per entity, stored with search metadata
//! 6. **Complete**: mark the file `indexed` and recount repository statistics
//!
//! A delete task (or a file that vanished before it could be read) removes
//! the file's vectors and entities and leaves a tombstone.

use crate::failure_policy::{ErrorClass, FailurePolicy, RetryDecision};
use crate::stats::StatsUpdater;
use crate::text_builder::build_embedding_text;
use chrono::{DateTime, Utc};
use codeweave_core::{
    content_checksum, ChangeKind, CodeEntity, Error, Extractor, FileTask, IndexedFile,
    PendingReference, Result, UnresolvedReference, VectorMetadata, VectorRecord,
};
use codeweave_embeddings::EmbeddingManager;
use codeweave_resolver::ReferenceResolver;
use codeweave_storage::{RelationGraph, StateStore, StorageHandles, VectorStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// What processing one task did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed {
        entities: usize,
        /// In-file relations plus references bound on the spot
        relations: usize,
        /// References left for the resolver
        pending: usize,
    },
    /// Only the embeddings of an already extracted file were regenerated
    Reembedded { vectors: usize },
    Deleted { entities: u64, vectors: u64 },
    /// Another worker holds the claim on the file
    AlreadyInProgress,
    /// The attempt failed and was recorded on the file
    Failed {
        decision: RetryDecision,
        error: String,
    },
}

/// Turns file tasks into entities, relations, pending references and vectors
pub struct IndexingPipeline {
    state: Arc<dyn StateStore>,
    graph: Arc<dyn RelationGraph>,
    vectors: Arc<dyn VectorStore>,
    extractor: Arc<dyn Extractor>,
    embeddings: Arc<EmbeddingManager>,
    resolver: Arc<ReferenceResolver>,
    stats: StatsUpdater,
    policy: FailurePolicy,
}

impl IndexingPipeline {
    pub fn new(
        storage: &StorageHandles,
        extractor: Arc<dyn Extractor>,
        embeddings: Arc<EmbeddingManager>,
        resolver: Arc<ReferenceResolver>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            state: Arc::clone(&storage.state),
            graph: Arc::clone(&storage.graph),
            vectors: Arc::clone(&storage.vectors),
            extractor,
            embeddings,
            resolver,
            stats: StatsUpdater::new(Arc::clone(&storage.state), Arc::clone(&storage.graph)),
            policy,
        }
    }

    /// Process one file task
    ///
    /// Failures of the file itself (unreadable, unparsable, embedding service
    /// down) are recorded on the file and returned as [`IndexOutcome::Failed`].
    ///
    /// # Errors
    /// Storage errors, after the failure has been recorded where possible, and
    /// tasks for files that are not tracked.
    pub async fn index_file(&self, task: &FileTask) -> Result<IndexOutcome> {
        let Some(file) = self.state.get_file(&task.file_id).await? else {
            if task.change == ChangeKind::Delete {
                return Ok(IndexOutcome::Deleted {
                    entities: 0,
                    vectors: 0,
                });
            }
            return Err(Error::not_found(format!(
                "file {} in repository {}",
                task.path, task.repository_id
            )));
        };
        if task.change == ChangeKind::Delete && file.is_tombstone() {
            return Ok(IndexOutcome::Deleted {
                entities: 0,
                vectors: 0,
            });
        }

        if !self.state.claim_file(&file.id).await? {
            debug!(path = %file.path, "File already claimed");
            return Ok(IndexOutcome::AlreadyInProgress);
        }

        // Fingerprint of the content read, kept on the file if the attempt fails
        let mut read_checksum = None;
        let result = match task.change {
            ChangeKind::Delete => self.delete_claimed(&file).await,
            ChangeKind::Create | ChangeKind::Update => {
                self.index_claimed(&file, &mut read_checksum).await
            }
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.handle_failure(&file, read_checksum.as_deref(), e).await,
        }
    }

    /// Regenerate the embeddings of a file whose extraction already succeeded
    pub async fn reembed_file(&self, file_id: &str) -> Result<IndexOutcome> {
        let file = self
            .state
            .get_file(file_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("file {file_id}")))?;
        if !self.state.claim_file(&file.id).await? {
            return Ok(IndexOutcome::AlreadyInProgress);
        }
        let checksum = file.checksum.clone();
        match self
            .embed_claimed(&file, checksum.as_deref(), file.file_size)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.handle_failure(&file, None, e).await,
        }
    }

    async fn index_claimed(
        &self,
        file: &IndexedFile,
        read_checksum: &mut Option<String>,
    ) -> Result<IndexOutcome> {
        let repository = self
            .state
            .get_repository(&file.repository_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("repository {}", file.repository_id)))?;
        let full_path = repository.root_path.join(&file.path);
        let bytes = match tokio::fs::read(&full_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %file.path, "File vanished before indexing");
                return self.delete_claimed(file).await;
            }
            Err(e) => return Err(e.into()),
        };
        let checksum = content_checksum(&bytes);
        let file_size = bytes.len() as u64;
        *read_checksum = Some(checksum.clone());

        if file.needs_embedding && file.checksum.as_deref() == Some(checksum.as_str()) {
            return self.embed_claimed(file, Some(&checksum), file_size).await;
        }

        let extraction = self
            .extractor
            .extract(&file.path, &bytes, &file.repository_id)
            .await?;
        let mut entities = extraction.entities;
        for entity in &mut entities {
            entity.file_id = file.id.clone();
            entity.vector_id = None;
        }

        self.vectors.delete_vectors_for_file(&file.id).await?;
        let replaced = self.graph.replace_file_entities(&file.id, &entities).await?;
        debug!(path = %file.path, replaced, inserted = entities.len(), "Replaced entities");

        for relation in &extraction.relations {
            self.graph.add_relation(relation).await?;
        }
        let (bound, pending) = self
            .relate_unresolved(&extraction.unresolved, &file.repository_id)
            .await?;

        if let Err(e) = self.embed_entities(&entities, file).await {
            if e.is_storage() {
                return Err(e);
            }
            return self.handle_embedding_failure(file, &checksum, e).await;
        }

        self.state
            .complete_file(&file.id, Some(&checksum), file_size)
            .await?;
        self.stats.refresh(&file.repository_id).await?;

        debug!(
            path = %file.path,
            entities = entities.len(),
            relations = extraction.relations.len() + bound,
            pending,
            "Indexed file"
        );
        Ok(IndexOutcome::Indexed {
            entities: entities.len(),
            relations: extraction.relations.len() + bound,
            pending,
        })
    }

    /// Store every unresolved reference and bind the ones with an exact target
    ///
    /// Bound references are kept as resolved records so the relation can be
    /// restored if the target file is re-extracted later.
    ///
    /// # Returns
    /// (references bound now, references left pending)
    async fn relate_unresolved(
        &self,
        unresolved: &[UnresolvedReference],
        repository_id: &str,
    ) -> Result<(usize, usize)> {
        let mut bound = 0;
        let mut pending = 0;
        for reference in unresolved {
            let reference = PendingReference::from_unresolved(reference, repository_id);
            self.graph.add_pending_reference(&reference).await?;
            match self.resolver.bind_exact(&reference).await? {
                Some(_) => bound += 1,
                None => pending += 1,
            }
        }
        Ok((bound, pending))
    }

    async fn embed_claimed(
        &self,
        file: &IndexedFile,
        checksum: Option<&str>,
        file_size: u64,
    ) -> Result<IndexOutcome> {
        let entities = self.graph.entities_for_file(&file.id).await?;
        self.vectors.delete_vectors_for_file(&file.id).await?;
        let vectors = match self.embed_entities(&entities, file).await {
            Ok(vectors) => vectors,
            Err(e) if e.is_storage() => return Err(e),
            Err(e) => {
                return self
                    .handle_embedding_failure(file, checksum.unwrap_or_default(), e)
                    .await
            }
        };

        self.state.complete_file(&file.id, checksum, file_size).await?;
        self.stats.refresh(&file.repository_id).await?;
        debug!(path = %file.path, vectors, "Re-embedded file");
        Ok(IndexOutcome::Reembedded { vectors })
    }

    /// Embed `entities` in provider-sized batches and store the vectors
    ///
    /// # Returns
    /// Number of vectors stored
    async fn embed_entities(&self, entities: &[CodeEntity], file: &IndexedFile) -> Result<usize> {
        let batch_size = self.embeddings.provider().max_batch_size().max(1);
        let mut stored = 0;

        for chunk in entities.chunks(batch_size) {
            let texts = chunk.iter().map(build_embedding_text).collect();
            let vectors = self.embeddings.embed(texts).await?;
            let records: Vec<VectorRecord> = chunk
                .iter()
                .zip(vectors)
                .map(|(entity, vector)| VectorRecord {
                    entity_id: entity.id.clone(),
                    vector,
                    metadata: VectorMetadata {
                        repository_id: entity.repository_id.clone(),
                        file_id: file.id.clone(),
                        file_path: file.path.clone(),
                        qualified_name: entity.qualified_name.clone(),
                        kind: entity.kind,
                        language: entity.language,
                    },
                })
                .collect();

            let ids = self.vectors.add_vectors(&records).await?;
            for (entity, vector_id) in chunk.iter().zip(&ids) {
                self.graph.set_vector_id(&entity.id, vector_id).await?;
            }
            stored += ids.len();
        }
        Ok(stored)
    }

    async fn delete_claimed(&self, file: &IndexedFile) -> Result<IndexOutcome> {
        let vectors = self.vectors.delete_vectors_for_file(&file.id).await?;
        let entities = self.graph.delete_entities_for_file(&file.id).await?;
        self.state.tombstone_file(&file.id).await?;
        self.stats.refresh(&file.repository_id).await?;
        debug!(path = %file.path, entities, vectors, "Removed file from index");
        Ok(IndexOutcome::Deleted { entities, vectors })
    }

    /// Record a failed attempt and act on the failure policy's decision
    async fn handle_failure(
        &self,
        file: &IndexedFile,
        checksum: Option<&str>,
        error: Error,
    ) -> Result<IndexOutcome> {
        let message = error.to_string();
        let updated = match self.state.fail_file(&file.id, checksum, &message).await {
            Ok(updated) => updated,
            Err(record_error) => {
                error!(
                    path = %file.path,
                    error = %record_error,
                    "Failed to record indexing failure"
                );
                return Err(error);
            }
        };

        let decision = self.policy.decide(updated.attempts, ErrorClass::of(&error));
        self.apply_decision(&updated, decision).await?;
        self.refresh_stats_quietly(&file.repository_id).await;
        warn!(
            path = %file.path,
            attempts = updated.attempts,
            ?decision,
            error = %message,
            "Indexing failed"
        );

        if error.is_storage() {
            return Err(error);
        }
        Ok(IndexOutcome::Failed {
            decision,
            error: message,
        })
    }

    /// Keep the extracted entities and schedule a re-embed
    async fn handle_embedding_failure(
        &self,
        file: &IndexedFile,
        checksum: &str,
        error: Error,
    ) -> Result<IndexOutcome> {
        let message = error.to_string();
        let checksum = (!checksum.is_empty()).then_some(checksum);
        let updated = self
            .state
            .mark_needs_embedding(&file.id, checksum, &message)
            .await?;

        let decision = self
            .policy
            .decide(updated.embedding_attempts, ErrorClass::of(&error));
        self.apply_decision(&updated, decision).await?;
        self.refresh_stats_quietly(&file.repository_id).await;
        warn!(
            path = %file.path,
            attempts = updated.embedding_attempts,
            ?decision,
            error = %message,
            "Embedding failed; entities kept"
        );
        Ok(IndexOutcome::Failed {
            decision,
            error: message,
        })
    }

    async fn apply_decision(&self, file: &IndexedFile, decision: RetryDecision) -> Result<()> {
        match decision {
            RetryDecision::RetryImmediately => {
                // An update task falls back to deletion when the file is gone
                self.state
                    .enqueue(&FileTask::new(
                        &file.repository_id,
                        &file.path,
                        ChangeKind::Update,
                    ))
                    .await?;
            }
            RetryDecision::RetryWithBackoff(delay) => {
                self.state
                    .schedule_retry(&file.id, Some(retry_at(Utc::now(), delay)))
                    .await?;
            }
            RetryDecision::GiveUp => {}
        }
        Ok(())
    }

    async fn refresh_stats_quietly(&self, repository_id: &str) {
        if let Err(e) = self.stats.refresh(repository_id).await {
            warn!(repository_id, error = %e, "Failed to refresh repository statistics");
        }
    }
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
    now + delay
}
