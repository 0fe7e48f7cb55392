//! Indexing pipeline against the in-memory backend, the bundled Python
//! extractor and the mock embedding provider

use anyhow::Result;
use codeweave_core::{
    ChangeKind, CodeEntity, FileStatus, FileTask, IndexedFile, IndexingConfig, RelationKind,
    Repository, ResolutionConfig, SearchFilters,
};
use codeweave_embeddings::{EmbeddingManager, MockEmbeddingProvider};
use codeweave_indexer::{FailurePolicy, IndexOutcome, IndexingPipeline, RetryDecision};
use codeweave_languages::ExtractorRegistry;
use codeweave_resolver::ReferenceResolver;
use codeweave_storage::StorageHandles;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DIMENSION: usize = 32;

struct Harness {
    dir: TempDir,
    storage: StorageHandles,
    repo: Repository,
    pipeline: IndexingPipeline,
    resolver: Arc<ReferenceResolver>,
}

impl Harness {
    async fn new() -> Result<Self> {
        Self::with_provider(MockEmbeddingProvider::new(DIMENSION)).await
    }

    async fn with_provider(provider: MockEmbeddingProvider) -> Result<Self> {
        let dir = TempDir::new()?;
        let storage = StorageHandles::memory();
        let repo = Repository::new("backend", dir.path(), "main");
        storage.state.upsert_repository(&repo).await?;

        let resolver = Arc::new(ReferenceResolver::new(
            storage.graph.clone(),
            storage.state.clone(),
            &ResolutionConfig {
                max_attempts: 3,
                ..ResolutionConfig::default()
            },
        ));
        let policy = FailurePolicy::from_config(&IndexingConfig {
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            ..IndexingConfig::default()
        });
        let pipeline = IndexingPipeline::new(
            &storage,
            Arc::new(ExtractorRegistry::with_defaults()),
            Arc::new(EmbeddingManager::new(Arc::new(provider), "mock")),
            Arc::clone(&resolver),
            policy,
        );
        Ok(Self {
            dir,
            storage,
            repo,
            pipeline,
            resolver,
        })
    }

    fn write(&self, path: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        std::fs::write(self.dir.path().join(path), contents)?;
        Ok(())
    }

    /// Register `path` and run its task through the pipeline
    async fn index(&self, path: &str, change: ChangeKind) -> Result<IndexOutcome> {
        if change != ChangeKind::Delete {
            let size = std::fs::metadata(self.dir.path().join(path))?.len();
            self.storage
                .state
                .upsert_file(&IndexedFile::discovered(&self.repo.id, path, size))
                .await?;
        }
        let task = FileTask::new(&self.repo.id, path, change);
        Ok(self.pipeline.index_file(&task).await?)
    }

    async fn entity(&self, qualified_name: &str) -> Result<CodeEntity> {
        let mut found = self.storage.graph.find_entities_by_name(qualified_name).await?;
        assert_eq!(found.len(), 1, "expected one entity named {qualified_name}");
        Ok(found.remove(0))
    }

    async fn file(&self, path: &str) -> Result<IndexedFile> {
        Ok(self
            .storage
            .state
            .get_file_by_path(&self.repo.id, path)
            .await?
            .expect("file is tracked"))
    }
}

#[tokio::test]
async fn test_forward_reference_binds_after_target_is_indexed() -> Result<()> {
    let h = Harness::new().await?;
    h.write("b.py", "from a import foo\nfoo()\n")?;
    h.write("a.py", "def foo():\n    pass\n")?;

    // b first: its references to a.foo cannot bind yet
    let outcome = h.index("b.py", ChangeKind::Create).await?;
    assert_eq!(
        outcome,
        IndexOutcome::Indexed {
            entities: 1,
            relations: 0,
            pending: 2
        }
    );
    h.index("a.py", ChangeKind::Create).await?;

    let stats = h.resolver.resolve_batch(100).await?;
    assert_eq!(stats.resolved, 2);

    let module_b = h.entity("b").await?;
    let foo = h.entity("a.foo").await?;
    let outgoing = h.storage.graph.relations_from(&module_b.id).await?;
    assert!(outgoing
        .iter()
        .any(|r| r.kind == RelationKind::Calls && r.target_id == foo.id));
    assert!(outgoing.iter().all(|r| !r.is_cross_repository));

    let repo = h.storage.state.get_repository(&h.repo.id).await?.unwrap();
    assert_eq!(repo.stats.pending_reference_count, 0);
    assert_eq!(repo.stats.file_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_reference_binds_immediately_when_target_exists() -> Result<()> {
    let h = Harness::new().await?;
    h.write("a.py", "def foo():\n    pass\n")?;
    h.write("b.py", "from a import foo\nfoo()\n")?;

    h.index("a.py", ChangeKind::Create).await?;
    let outcome = h.index("b.py", ChangeKind::Create).await?;
    assert_eq!(
        outcome,
        IndexOutcome::Indexed {
            entities: 1,
            relations: 2,
            pending: 0
        }
    );
    assert_eq!(h.storage.graph.count_pending_references(&h.repo.id).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_reindexing_unchanged_file_is_idempotent() -> Result<()> {
    let h = Harness::new().await?;
    h.write("a.py", "def foo():\n    pass\n\ndef bar():\n    foo()\n")?;

    h.index("a.py", ChangeKind::Create).await?;
    let entities = h.storage.graph.count_entities(&h.repo.id).await?;
    let relations = h.storage.graph.count_relations(&h.repo.id).await?;

    h.index("a.py", ChangeKind::Update).await?;
    assert_eq!(h.storage.graph.count_entities(&h.repo.id).await?, entities);
    assert_eq!(h.storage.graph.count_relations(&h.repo.id).await?, relations);

    let filters = SearchFilters {
        file_path: Some("a.py".to_string()),
        ..SearchFilters::default()
    };
    let hits = h
        .storage
        .vectors
        .search(&vec![1.0; DIMENSION], 100, &filters)
        .await?;
    assert_eq!(hits.len() as u64, entities);

    let file = h.file("a.py").await?;
    assert_eq!(file.status, FileStatus::Indexed);
    assert_eq!(file.attempts, 0);
    assert!(file.checksum.is_some());
    Ok(())
}

#[tokio::test]
async fn test_deletion_cascades_and_reopens_references() -> Result<()> {
    let h = Harness::new().await?;
    h.write("a.py", "def foo():\n    pass\n")?;
    h.write("b.py", "from a import foo\nfoo()\n")?;
    h.index("a.py", ChangeKind::Create).await?;
    h.index("b.py", ChangeKind::Create).await?;
    let module_b = h.entity("b").await?;

    std::fs::remove_file(h.dir.path().join("a.py"))?;
    let outcome = h.index("a.py", ChangeKind::Delete).await?;
    assert_eq!(
        outcome,
        IndexOutcome::Deleted {
            entities: 2,
            vectors: 2
        }
    );

    assert!(h.storage.graph.find_entities_by_name("a.foo").await?.is_empty());
    assert!(h
        .storage
        .graph
        .relations_from(&module_b.id)
        .await?
        .is_empty());
    // b's references wait for a.foo to come back
    assert_eq!(h.storage.graph.count_pending_references(&h.repo.id).await?, 2);
    assert_eq!(h.file("a.py").await?.status, FileStatus::Deleted);

    let repo = h.storage.state.get_repository(&h.repo.id).await?.unwrap();
    assert_eq!(repo.stats.file_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_vanished_file_is_treated_as_deleted() -> Result<()> {
    let h = Harness::new().await?;
    h.write("a.py", "x = 1\n")?;
    h.index("a.py", ChangeKind::Create).await?;

    std::fs::remove_file(h.dir.path().join("a.py"))?;
    let task = FileTask::new(&h.repo.id, "a.py", ChangeKind::Update);
    let outcome = h.pipeline.index_file(&task).await?;
    assert!(matches!(outcome, IndexOutcome::Deleted { .. }));
    assert_eq!(h.file("a.py").await?.status, FileStatus::Deleted);
    Ok(())
}

#[tokio::test]
async fn test_claimed_file_is_left_alone() -> Result<()> {
    let h = Harness::new().await?;
    h.write("a.py", "def foo():\n    pass\n")?;
    let file = h
        .storage
        .state
        .upsert_file(&IndexedFile::discovered(&h.repo.id, "a.py", 20))
        .await?;
    assert!(h.storage.state.claim_file(&file.id).await?);

    let task = FileTask::new(&h.repo.id, "a.py", ChangeKind::Create);
    assert_eq!(
        h.pipeline.index_file(&task).await?,
        IndexOutcome::AlreadyInProgress
    );
    assert_eq!(h.storage.graph.count_entities(&h.repo.id).await?, 0);
    assert!(!h.storage.state.claim_file(&file.id).await?);
    Ok(())
}

#[tokio::test]
async fn test_unparsable_file_gives_up() -> Result<()> {
    let h = Harness::new().await?;
    h.write("bad.py", [0xffu8, 0xfe, 0x00])?;

    let outcome = h.index("bad.py", ChangeKind::Create).await?;
    assert!(matches!(
        outcome,
        IndexOutcome::Failed {
            decision: RetryDecision::GiveUp,
            ..
        }
    ));
    let file = h.file("bad.py").await?;
    assert_eq!(file.status, FileStatus::Failed);
    assert_eq!(file.attempts, 1);
    assert!(file.last_error.is_some());
    assert_eq!(h.storage.state.queue_len().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_embedding_failure_keeps_entities_and_reembeds() -> Result<()> {
    let h = Harness::with_provider(MockEmbeddingProvider::new(DIMENSION).failing(1, true)).await?;
    h.write("a.py", "def foo():\n    pass\n")?;

    let outcome = h.index("a.py", ChangeKind::Create).await?;
    assert!(matches!(
        outcome,
        IndexOutcome::Failed {
            decision: RetryDecision::RetryImmediately,
            ..
        }
    ));
    let file = h.file("a.py").await?;
    assert!(file.needs_embedding);
    assert_eq!(file.embedding_attempts, 1);
    assert_eq!(h.storage.graph.count_entities(&h.repo.id).await?, 2);
    // Immediate retry is already queued
    assert_eq!(h.storage.state.queue_len().await?, 1);

    let foo_before = h.entity("a.foo").await?;
    let task = FileTask::new(&h.repo.id, "a.py", ChangeKind::Update);
    assert_eq!(
        h.pipeline.index_file(&task).await?,
        IndexOutcome::Reembedded { vectors: 2 }
    );

    // Extraction was skipped: same entity, now with a vector
    let foo_after = h.entity("a.foo").await?;
    assert_eq!(foo_after.id, foo_before.id);
    assert!(foo_after.vector_id.is_some());
    let file = h.file("a.py").await?;
    assert_eq!(file.status, FileStatus::Indexed);
    assert!(!file.needs_embedding);
    Ok(())
}

#[tokio::test]
async fn test_repeated_embedding_failures_back_off() -> Result<()> {
    let h = Harness::with_provider(MockEmbeddingProvider::new(DIMENSION).failing(2, true)).await?;
    h.write("a.py", "def foo():\n    pass\n")?;

    h.index("a.py", ChangeKind::Create).await?;
    let task = FileTask::new(&h.repo.id, "a.py", ChangeKind::Update);
    let outcome = h.pipeline.index_file(&task).await?;
    assert!(matches!(
        outcome,
        IndexOutcome::Failed {
            decision: RetryDecision::RetryWithBackoff(delay),
            ..
        } if delay == Duration::from_secs(1)
    ));

    let file = h.file("a.py").await?;
    assert!(file.retry_after.is_some());
    let later = chrono::Utc::now() + chrono::Duration::hours(1);
    let due = h.storage.state.retryable_files(later, 10).await?;
    assert_eq!(due.len(), 1);

    h.pipeline.reembed_file(&file.id).await?;
    assert_eq!(h.file("a.py").await?.status, FileStatus::Indexed);
    Ok(())
}

#[tokio::test]
async fn test_unmatched_reference_fails_after_attempt_cap() -> Result<()> {
    let h = Harness::new().await?;
    h.write("b.py", "from missing import thing\nthing()\n")?;
    h.index("b.py", ChangeKind::Create).await?;

    for _ in 0..2 {
        let stats = h.resolver.resolve_batch(100).await?;
        assert_eq!(stats.still_pending, 2);
    }
    let stats = h.resolver.resolve_batch(100).await?;
    assert_eq!(stats.failed, 2);
    assert_eq!(h.resolver.resolve_batch(100).await?.claimed, 0);

    let module_b = h.entity("b").await?;
    assert!(h
        .storage
        .graph
        .relations_from(&module_b.id)
        .await?
        .is_empty());
    Ok(())
}
