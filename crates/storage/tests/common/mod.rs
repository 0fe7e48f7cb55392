//! Fixtures shared by the storage contract tests

use codeweave_core::{
    CodeEntity, CodeEntityBuilder, EntityKind, IndexedFile, Language, Repository, SourceSpan,
    VectorMetadata, VectorRecord,
};
use codeweave_storage::StorageHandles;
use std::future::Future;
use std::time::Duration;

/// Fail a test that hangs instead of blocking the suite
#[allow(dead_code)]
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| anyhow::anyhow!("test timed out after {duration:?}"))?
}

/// Register a repository with a unique name so live backends can be reused
#[allow(dead_code)]
pub async fn create_repository(handles: &StorageHandles) -> anyhow::Result<Repository> {
    let name = format!("repo-{}", uuid::Uuid::new_v4());
    let repository = Repository::new(name, "/srv/repo", "main");
    handles.state.upsert_repository(&repository).await?;
    Ok(repository)
}

/// Register a pending file
#[allow(dead_code)]
pub async fn create_file(
    handles: &StorageHandles,
    repository: &Repository,
    path: &str,
) -> anyhow::Result<IndexedFile> {
    let file = IndexedFile::discovered(&repository.id, path, 64);
    Ok(handles.state.upsert_file(&file).await?)
}

/// Entity owned by `file`
#[allow(dead_code)]
pub fn entity(file: &IndexedFile, qualified_name: &str, kind: EntityKind, line: usize) -> CodeEntity {
    let simple_name = qualified_name
        .rsplit('.')
        .next()
        .unwrap_or(qualified_name)
        .to_string();
    CodeEntityBuilder::default()
        .repository_id(file.repository_id.clone())
        .file_id(file.id.clone())
        .qualified_name(qualified_name)
        .simple_name(simple_name)
        .kind(kind)
        .language(Language::Python)
        .span(SourceSpan::new(line, line + 2, 0, 0))
        .build()
        .expect("Failed to build test entity")
}

/// Vector record for `entity` stored against `file`
#[allow(dead_code)]
pub fn vector_record(entity: &CodeEntity, file: &IndexedFile, vector: Vec<f32>) -> VectorRecord {
    VectorRecord {
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
    }
}
