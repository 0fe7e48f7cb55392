//! Config loading and wiring used by the binary, against a dry-run setup

use anyhow::Result;
use codeweave::output::{format_hits, format_run, format_status};
use codeweave::{build_orchestrator, load_config};
use codeweave_core::SearchFilters;
use tempfile::TempDir;

fn write_config(dir: &TempDir, repo: &TempDir) -> Result<std::path::PathBuf> {
    let path = dir.path().join("config.toml");
    let toml = format!(
        r#"
[[repositories]]
name = "backend"
path = "{}"

[storage]
backend = "postgres"
"#,
        repo.path().display()
    );
    std::fs::write(&path, toml)?;
    Ok(path)
}

#[tokio::test]
async fn test_memory_flag_overrides_backend_and_provider() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = TempDir::new()?;
    let path = write_config(&dir, &repo)?;

    let config = load_config(Some(&path), true)?;
    assert_eq!(config.storage.backend, "memory");
    assert_eq!(config.embeddings.provider, "mock");
    assert_eq!(config.repositories.len(), 1);
    assert_eq!(config.repositories[0].name, "backend");
    Ok(())
}

#[tokio::test]
async fn test_dry_run_indexes_and_answers_queries() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = TempDir::new()?;
    std::fs::write(repo.path().join("a.py"), "def foo():\n    pass\n")?;
    std::fs::write(repo.path().join("b.py"), "from a import foo\nfoo()\n")?;
    let path = write_config(&dir, &repo)?;

    let orchestrator = build_orchestrator(load_config(Some(&path), true)?).await?;
    let report = orchestrator.run_once().await?;
    let text = format_run(&report);
    assert!(text.contains("backend: 2 created"), "{text}");
    assert!(text.contains("indexed 2"), "{text}");

    let status = orchestrator.query().get_index_status(None).await?;
    let text = format_status(&status);
    assert!(text.starts_with("backend [watching]"), "{text}");
    assert!(text.contains("2 indexed, 0 pending"), "{text}");

    let hits = orchestrator
        .query()
        .search("foo", 5, &SearchFilters::default())
        .await?;
    assert!(!hits.is_empty());
    let text = format_hits(&hits);
    assert!(text.starts_with(" 1. "), "{text}");

    let json = serde_json::to_value(&status)?;
    assert_eq!(json[0]["repository"]["name"], "backend");
    assert_eq!(json[0]["file_counts"]["indexed"], 2);
    Ok(())
}
