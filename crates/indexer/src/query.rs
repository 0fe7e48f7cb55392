//! Read side of the index: semantic search, entity lookup, references and
//! indexing status, plus on-demand reindexing

use crate::scanner::{ChangeScanner, ScanReport};
use codeweave_core::{
    CodeEntity, CodeRelation, Error, FileStatus, FileStatusCounts, Repository, Result,
    SearchFilters,
};
use codeweave_embeddings::EmbeddingManager;
use codeweave_storage::{RelationGraph, StateStore, StorageHandles, VectorStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// One semantic search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub entity: CodeEntity,
    /// Cosine similarity to the query
    pub score: f32,
}

/// Relations touching one entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct References {
    pub incoming: Vec<CodeRelation>,
    pub outgoing: Vec<CodeRelation>,
}

/// Indexing state of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatusEntry {
    pub path: String,
    pub status: FileStatus,
    pub attempts: u32,
    pub needs_embedding: bool,
    pub last_error: Option<String>,
}

/// Indexing state of one repository
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryStatusReport {
    pub repository: Repository,
    pub file_counts: FileStatusCounts,
    /// Tracked files, tombstones excluded, ordered by path
    pub files: Vec<FileStatusEntry>,
}

/// Queries over the indexed repositories
pub struct QueryService {
    state: Arc<dyn StateStore>,
    graph: Arc<dyn RelationGraph>,
    vectors: Arc<dyn VectorStore>,
    embeddings: Arc<EmbeddingManager>,
    scanner: ChangeScanner,
}

impl QueryService {
    pub fn new(
        storage: &StorageHandles,
        embeddings: Arc<EmbeddingManager>,
        scanner: ChangeScanner,
    ) -> Self {
        Self {
            state: Arc::clone(&storage.state),
            graph: Arc::clone(&storage.graph),
            vectors: Arc::clone(&storage.vectors),
            embeddings,
            scanner,
        }
    }

    /// Entities most similar to `text`, best first
    ///
    /// Hits whose entity disappeared between the vector search and the lookup
    /// are dropped.
    pub async fn search(
        &self,
        text: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        if text.trim().is_empty() {
            return Err(Error::invalid_input("Search query is empty"));
        }
        let query = self.embeddings.embed_query(text).await?;
        let scored = self.vectors.search(&query, limit, filters).await?;

        let mut hits = Vec::with_capacity(scored.len());
        for hit in scored {
            match self.graph.get_entity(&hit.entity_id).await? {
                Some(entity) => hits.push(SearchHit {
                    entity,
                    score: hit.score,
                }),
                None => debug!(entity_id = %hit.entity_id, "Dropping hit for missing entity"),
            }
        }
        Ok(hits)
    }

    /// Every entity with exactly this qualified name
    pub async fn get_entity(&self, qualified_name: &str) -> Result<Vec<CodeEntity>> {
        self.graph.find_entities_by_name(qualified_name).await
    }

    /// Incoming and outgoing relations of an entity
    ///
    /// # Errors
    /// `NotFound` when no entity has this id
    pub async fn get_references(&self, entity_id: &str) -> Result<References> {
        if self.graph.get_entity(entity_id).await?.is_none() {
            return Err(Error::not_found(format!("entity {entity_id}")));
        }
        Ok(References {
            incoming: self.graph.relations_to(entity_id).await?,
            outgoing: self.graph.relations_from(entity_id).await?,
        })
    }

    /// Status of one repository (by name or id) or of all of them
    pub async fn get_index_status(
        &self,
        repository: Option<&str>,
    ) -> Result<Vec<RepositoryStatusReport>> {
        let repositories = match repository {
            Some(key) => vec![self.find_repository(key).await?],
            None => self.state.list_repositories().await?,
        };

        let mut reports = Vec::with_capacity(repositories.len());
        for repository in repositories {
            let file_counts = self.state.count_files_by_status(&repository.id).await?;
            let mut files: Vec<FileStatusEntry> = self
                .state
                .list_files(&repository.id)
                .await?
                .into_iter()
                .filter(|f| !f.is_tombstone())
                .map(|f| FileStatusEntry {
                    path: f.path,
                    status: f.status,
                    attempts: f.attempts,
                    needs_embedding: f.needs_embedding,
                    last_error: f.last_error,
                })
                .collect();
            files.sort_by(|a, b| a.path.cmp(&b.path));
            reports.push(RepositoryStatusReport {
                repository,
                file_counts,
                files,
            });
        }
        Ok(reports)
    }

    /// Rescan a repository
    ///
    /// With `force`, failed files get a fresh attempt budget and every file is
    /// queued whether or not it changed.
    pub async fn reindex(&self, repository: &str, force: bool) -> Result<ScanReport> {
        let repository = self.find_repository(repository).await?;
        if force {
            let reset = self.state.reset_failed(&repository.id).await?;
            info!(repository = %repository.name, reset, "Reset failed files");
        }
        self.scanner.scan_with(&repository, force).await
    }

    async fn find_repository(&self, key: &str) -> Result<Repository> {
        if let Some(repository) = self.state.get_repository_by_name(key).await? {
            return Ok(repository);
        }
        self.state
            .get_repository(key)
            .await?
            .ok_or_else(|| Error::not_found(format!("repository {key}")))
    }
}
