//! End-to-end runs of the orchestrator over temporary repositories

use anyhow::Result;
use codeweave_core::{
    Config, Error, FileStatus, HealthStatus, IndexedFile, IndexingConfig, RelationKind,
    RepositoryConfig, RepositoryStatus, ResolutionConfig, SearchFilters,
};
use codeweave_embeddings::{EmbeddingManager, MockEmbeddingProvider};
use codeweave_indexer::Orchestrator;
use codeweave_languages::ExtractorRegistry;
use codeweave_storage::{RelationGraph, StorageHandles};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config_for(repos: &[(&str, &Path)]) -> Config {
    Config {
        repositories: repos
            .iter()
            .map(|(name, path)| RepositoryConfig {
                name: name.to_string(),
                path: path.to_path_buf(),
                branch: "main".to_string(),
                depends_on: Vec::new(),
            })
            .collect(),
        indexing: IndexingConfig {
            max_workers: 2,
            poll_interval_ms: 20,
            stale_claim_secs: 0,
            watch: false,
            ..IndexingConfig::default()
        },
        resolution: ResolutionConfig {
            max_attempts: 3,
            ..ResolutionConfig::default()
        },
        ..Config::default()
    }
}

fn orchestrator(config: Config) -> Result<Orchestrator> {
    Ok(Orchestrator::new(
        config,
        StorageHandles::memory(),
        Arc::new(ExtractorRegistry::with_defaults()),
        Arc::new(EmbeddingManager::new(
            Arc::new(MockEmbeddingProvider::new(64)),
            "mock",
        )),
    )?)
}

fn write(root: &Path, path: &str, contents: &str) -> Result<()> {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(full, contents)?;
    Ok(())
}

async fn has_call(orchestrator: &Orchestrator, source: &str, target: &str) -> Result<bool> {
    let graph = &orchestrator.storage().graph;
    let Some(source) = graph.find_entities_by_name(source).await?.pop() else {
        return Ok(false);
    };
    let Some(target) = graph.find_entities_by_name(target).await?.pop() else {
        return Ok(false);
    };
    Ok(graph
        .relations_from(&source.id)
        .await?
        .iter()
        .any(|r| r.kind == RelationKind::Calls && r.target_id == target.id))
}

#[tokio::test]
async fn test_run_once_indexes_and_resolves() -> Result<()> {
    let dir = TempDir::new()?;
    write(dir.path(), "b.py", "from a import foo\nfoo()\n")?;
    write(dir.path(), "a.py", "def foo():\n    pass\n")?;
    write(dir.path(), "README.md", "# not python\n")?;

    let orchestrator = orchestrator(config_for(&[("backend", dir.path())]))?;
    let report = orchestrator.run_once().await?;

    assert_eq!(report.scans.len(), 1);
    assert_eq!(report.scans[0].1.created, 2);
    assert_eq!(report.drain.indexed, 2);
    assert_eq!(report.drain.failed, 0);
    assert!(has_call(&orchestrator, "b", "a.foo").await?);

    let status = orchestrator.query().get_index_status(Some("backend")).await?;
    assert_eq!(status.len(), 1);
    let repo = &status[0];
    assert_eq!(repo.repository.status, RepositoryStatus::Watching);
    assert_eq!(repo.repository.stats.file_count, 2);
    assert_eq!(repo.repository.stats.pending_reference_count, 0);
    assert_eq!(repo.file_counts.indexed, 2);
    let paths: Vec<&str> = repo.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.py", "b.py"]);
    assert_eq!(orchestrator.health(), HealthStatus::Healthy);
    Ok(())
}

#[tokio::test]
async fn test_second_run_only_processes_changes() -> Result<()> {
    let dir = TempDir::new()?;
    write(dir.path(), "a.py", "def foo():\n    pass\n")?;
    write(dir.path(), "pkg/b.py", "def bar():\n    pass\n")?;

    let orchestrator = orchestrator(config_for(&[("backend", dir.path())]))?;
    orchestrator.run_once().await?;

    write(dir.path(), "a.py", "def foo():\n    return 1\n\ndef baz():\n    foo()\n")?;
    std::fs::remove_file(dir.path().join("pkg/b.py"))?;
    let report = orchestrator.run_once().await?;

    let scan = &report.scans[0].1;
    assert_eq!((scan.created, scan.updated, scan.deleted), (0, 1, 1));
    assert_eq!(report.drain.indexed, 1);
    assert_eq!(report.drain.deleted, 1);

    let graph = &orchestrator.storage().graph;
    assert!(graph.find_entities_by_name("pkg.b.bar").await?.is_empty());
    assert!(has_call(&orchestrator, "a.baz", "a.foo").await?);

    // Nothing changed since the last run
    let report = orchestrator.run_once().await?;
    assert_eq!(report.scans[0].1.queued(), 0);
    assert_eq!(report.drain.indexed, 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_file_is_requeued_once_edited() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("bad.py"), [0xff, 0xfe, b'\n'])?;

    let orchestrator = orchestrator(config_for(&[("backend", dir.path())]))?;
    let report = orchestrator.run_once().await?;
    assert_eq!(report.drain.failed, 1);

    // Unchanged content stays with the retry loop
    let report = orchestrator.run_once().await?;
    assert_eq!(report.scans[0].1.unchanged, 1);
    assert_eq!(report.scans[0].1.queued(), 0);

    write(dir.path(), "bad.py", "def foo():\n    pass\n")?;
    let report = orchestrator.run_once().await?;
    assert_eq!(report.scans[0].1.updated, 1);
    assert_eq!(report.drain.indexed, 1);

    let status = orchestrator.query().get_index_status(Some("backend")).await?;
    assert_eq!(status[0].files[0].status, FileStatus::Indexed);
    assert_eq!(
        orchestrator
            .storage()
            .graph
            .find_entities_by_name("bad.foo")
            .await?
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_cross_repository_reference() -> Result<()> {
    let shared = TempDir::new()?;
    let service = TempDir::new()?;
    write(shared.path(), "util.py", "def helper():\n    pass\n")?;
    write(service.path(), "app.py", "from util import helper\nhelper()\n")?;

    let mut config = config_for(&[("shared", shared.path()), ("service", service.path())]);
    config.repositories[1].depends_on = vec!["shared".to_string()];
    let orchestrator = orchestrator(config)?;
    orchestrator.run_once().await?;

    let graph = &orchestrator.storage().graph;
    let app = graph.find_entities_by_name("app").await?.remove(0);
    let calls: Vec<_> = graph
        .relations_from(&app.id)
        .await?
        .into_iter()
        .filter(|r| r.kind == RelationKind::Calls)
        .collect();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].is_cross_repository);
    assert_eq!(calls[0].repository_id, app.repository_id);
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_reference_stops_after_attempt_cap() -> Result<()> {
    let dir = TempDir::new()?;
    write(dir.path(), "b.py", "from nowhere import thing\nthing()\n")?;
    let orchestrator = orchestrator(config_for(&[("backend", dir.path())]))?;

    let mut failed = 0;
    for _ in 0..3 {
        failed += orchestrator.run_once().await?.resolution.failed;
    }
    assert_eq!(failed, 2);

    let report = orchestrator.run_once().await?;
    assert_eq!(report.resolution.claimed, 0);
    let repo_id = &orchestrator.query().get_index_status(Some("backend")).await?[0]
        .repository
        .id;
    assert_eq!(
        orchestrator
            .storage()
            .graph
            .count_pending_references(repo_id)
            .await?,
        0
    );
    Ok(())
}

#[tokio::test]
async fn test_recover_releases_abandoned_claims() -> Result<()> {
    let dir = TempDir::new()?;
    write(dir.path(), "a.py", "def foo():\n    pass\n")?;
    let orchestrator = orchestrator(config_for(&[("backend", dir.path())]))?;
    let repos = orchestrator.reconcile_repositories().await?;

    // A worker claimed the file and died
    let state = &orchestrator.storage().state;
    let file = state
        .upsert_file(&IndexedFile::discovered(&repos[0].id, "a.py", 20))
        .await?;
    assert!(state.claim_file(&file.id).await?);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = orchestrator.recover().await?;
    assert_eq!(report.stale_claims, 1);
    assert_eq!(report.orphans, 1);
    assert_eq!(state.get_file(&file.id).await?.unwrap().status, FileStatus::Pending);

    let drain = orchestrator.drain_backlog().await?;
    assert_eq!(drain.indexed, 1);
    assert_eq!(
        state.get_file(&file.id).await?.unwrap().status,
        FileStatus::Indexed
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_repository_root_marks_repository_failed() -> Result<()> {
    let dir = TempDir::new()?;
    write(dir.path(), "a.py", "x = 1\n")?;
    let missing = dir.path().join("does-not-exist");
    let orchestrator = orchestrator(config_for(&[
        ("good", dir.path()),
        ("gone", missing.as_path()),
    ]))?;

    let report = orchestrator.run_once().await?;
    assert_eq!(report.scans.len(), 1);
    assert_eq!(report.drain.indexed, 1);

    let status = orchestrator.query().get_index_status(Some("gone")).await?;
    assert_eq!(status[0].repository.status, RepositoryStatus::Failed);
    assert!(status[0].repository.last_error.is_some());
    Ok(())
}

#[tokio::test]
async fn test_queries_over_indexed_repository() -> Result<()> {
    let dir = TempDir::new()?;
    write(
        dir.path(),
        "billing.py",
        "def compute_invoice_total(items):\n    \"\"\"Sum invoice line items\"\"\"\n    return sum(items)\n\ndef send_invoice():\n    compute_invoice_total([])\n",
    )?;
    write(dir.path(), "auth.py", "def check_password(user):\n    pass\n")?;
    let orchestrator = orchestrator(config_for(&[("backend", dir.path())]))?;
    orchestrator.run_once().await?;
    let query = orchestrator.query();

    let hits = query
        .search("compute invoice total", 3, &SearchFilters::default())
        .await?;
    // Five entities are indexed; the limit caps the result
    assert_eq!(hits.len(), 3);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

    let filtered = query
        .search(
            "compute invoice total",
            10,
            &SearchFilters {
                file_path: Some("auth.py".to_string()),
                ..SearchFilters::default()
            },
        )
        .await?;
    let mut names: Vec<&str> = filtered
        .iter()
        .map(|h| h.entity.qualified_name.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["auth", "auth.check_password"]);

    assert!(matches!(
        query.search("   ", 3, &SearchFilters::default()).await,
        Err(Error::InvalidInput(_))
    ));

    let total = query.get_entity("billing.compute_invoice_total").await?;
    assert_eq!(total.len(), 1);
    let references = query.get_references(&total[0].id).await?;
    assert!(references
        .incoming
        .iter()
        .any(|r| r.kind == RelationKind::Calls));
    assert!(matches!(
        query.get_references("no-such-entity").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        query.get_index_status(Some("unknown")).await,
        Err(Error::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_forced_reindex_requeues_every_file() -> Result<()> {
    let dir = TempDir::new()?;
    write(dir.path(), "a.py", "def foo():\n    pass\n")?;
    write(dir.path(), "b.py", "def bar():\n    pass\n")?;
    let orchestrator = orchestrator(config_for(&[("backend", dir.path())]))?;
    orchestrator.run_once().await?;

    let query = orchestrator.query();
    assert_eq!(query.reindex("backend", false).await?.queued(), 0);
    let report = query.reindex("backend", true).await?;
    assert_eq!(report.updated, 2);

    let drain = orchestrator.drain_backlog().await?;
    assert_eq!(drain.indexed, 2);
    Ok(())
}

#[tokio::test]
async fn test_watch_mode_indexes_new_files() -> Result<()> {
    let dir = TempDir::new()?;
    write(dir.path(), "a.py", "def foo():\n    pass\n")?;
    let mut config = config_for(&[("backend", dir.path())]);
    config.indexing.watch = true;
    config.watcher.debounce_ms = 50;
    let orchestrator = orchestrator(config)?;

    orchestrator.start().await?;
    let graph = &orchestrator.storage().graph;
    wait_for_entity(graph.as_ref(), "a.foo").await?;
    // Let the watcher settle before touching the tree
    tokio::time::sleep(Duration::from_millis(200)).await;

    write(dir.path(), "b.py", "def bar():\n    pass\n")?;
    wait_for_entity(graph.as_ref(), "b.bar").await?;

    orchestrator.shutdown().await;
    Ok(())
}

async fn wait_for_entity(graph: &dyn RelationGraph, qualified_name: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while graph.find_entities_by_name(qualified_name).await?.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{qualified_name} was not indexed within 10s"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Ok(())
}
