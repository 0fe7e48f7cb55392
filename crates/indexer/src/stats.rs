//! Repository statistics, recomputed from count queries

use codeweave_core::{RepositoryStats, RepositoryStatus, Result};
use codeweave_storage::{RelationGraph, StateStore};
use std::sync::Arc;
use tracing::debug;

/// Recounts a repository's files, entities, relations and pending references
#[derive(Clone)]
pub struct StatsUpdater {
    state: Arc<dyn StateStore>,
    graph: Arc<dyn RelationGraph>,
}

impl StatsUpdater {
    pub fn new(state: Arc<dyn StateStore>, graph: Arc<dyn RelationGraph>) -> Self {
        Self { state, graph }
    }

    /// Recount everything for `repository_id` and store the result
    ///
    /// The repository is `watching` once no file is pending or being indexed,
    /// `indexing` otherwise.
    pub async fn refresh(&self, repository_id: &str) -> Result<RepositoryStats> {
        let files = self.state.count_files_by_status(repository_id).await?;
        let stats = RepositoryStats {
            file_count: files.live(),
            entity_count: self.graph.count_entities(repository_id).await?,
            relation_count: self.graph.count_relations(repository_id).await?,
            pending_reference_count: self.graph.count_pending_references(repository_id).await?,
        };
        let status = if files.pending == 0 && files.indexing == 0 {
            RepositoryStatus::Watching
        } else {
            RepositoryStatus::Indexing
        };

        self.state
            .record_repository_stats(repository_id, stats, status)
            .await?;
        debug!(
            repository_id,
            files = stats.file_count,
            entities = stats.entity_count,
            relations = stats.relation_count,
            pending = stats.pending_reference_count,
            %status,
            "Repository statistics refreshed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::{IndexedFile, Repository};
    use codeweave_storage::StorageHandles;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_status_follows_outstanding_files() {
        let storage = StorageHandles::memory();
        let repo = Repository::new("backend", "/srv/backend", "main");
        storage.state.upsert_repository(&repo).await.unwrap();
        let file = storage
            .state
            .upsert_file(&IndexedFile::discovered(&repo.id, "a.py", 10))
            .await
            .unwrap();

        let updater = StatsUpdater::new(storage.state.clone(), storage.graph.clone());
        let stats = updater.refresh(&repo.id).await.unwrap();
        assert_eq!(stats.file_count, 1);
        let stored = storage.state.get_repository(&repo.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RepositoryStatus::Indexing);

        storage.state.claim_file(&file.id).await.unwrap();
        storage.state.complete_file(&file.id, Some("abc"), 10).await.unwrap();
        updater.refresh(&repo.id).await.unwrap();
        let stored = storage.state.get_repository(&repo.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RepositoryStatus::Watching);
        assert_eq!(stored.stats.file_count, 1);
    }
}
