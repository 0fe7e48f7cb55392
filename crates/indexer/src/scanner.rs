//! Change scanner: compares a repository's working tree with the tracked files
//!
//! A scan walks the repository root, fingerprints every selected file and
//! queues a [`FileTask`] for each file that is new, changed, or gone. Files
//! whose fingerprint matches the last indexed version are left alone.

use crate::filter::{relative_path, FileFilter};
use chrono::Utc;
use codeweave_core::{
    content_checksum, ChangeKind, Error, FileTask, IndexedFile, Repository, Result, ResultExt,
};
use codeweave_storage::StateStore;
use futures::stream::{self, StreamExt};
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Files fingerprinted concurrently during a scan
const CHECKSUM_CONCURRENCY: usize = 16;

/// Outcome counters of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Files over the size limit or unreadable
    pub skipped: usize,
}

impl ScanReport {
    /// Tasks put on the queue by the scan
    pub fn queued(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Debug)]
struct DiscoveredFile {
    relative_path: String,
    size: u64,
}

/// Finds created, modified and deleted files and queues them for indexing
#[derive(Clone)]
pub struct ChangeScanner {
    state: Arc<dyn StateStore>,
    filter: Arc<FileFilter>,
}

impl ChangeScanner {
    pub fn new(state: Arc<dyn StateStore>, filter: Arc<FileFilter>) -> Self {
        Self { state, filter }
    }

    /// Queue every change since the last scan of `repository`
    pub async fn scan(&self, repository: &Repository) -> Result<ScanReport> {
        self.scan_with(repository, false).await
    }

    /// Scan `repository`; with `force`, unchanged files are queued as updates too
    ///
    /// `last_scan_at` is only advanced when the whole pass succeeded.
    ///
    /// # Errors
    /// Returns an error when the root is not a directory or a storage call
    /// fails. Unreadable files are counted as skipped instead.
    pub async fn scan_with(&self, repository: &Repository, force: bool) -> Result<ScanReport> {
        let started_at = Utc::now();
        let root = repository.root_path.clone();
        let metadata = tokio::fs::metadata(&root)
            .await
            .context(format!("Repository root {} is unavailable", root.display()))?;
        if !metadata.is_dir() {
            return Err(Error::invalid_input(format!(
                "Repository root {} is not a directory",
                root.display()
            )));
        }

        let mut report = ScanReport::default();
        let (discovered, skipped) = discover_files(root.clone(), Arc::clone(&self.filter)).await?;
        report.skipped += skipped;

        let known: HashMap<String, IndexedFile> = self
            .state
            .list_files(&repository.id)
            .await?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();

        let fingerprints: Vec<(DiscoveredFile, std::io::Result<String>)> = stream::iter(discovered)
            .map(|file| {
                let full_path = root.join(&file.relative_path);
                async move {
                    let checksum = tokio::fs::read(&full_path)
                        .await
                        .map(|bytes| content_checksum(&bytes));
                    (file, checksum)
                }
            })
            .buffer_unordered(CHECKSUM_CONCURRENCY)
            .collect()
            .await;

        let mut present = HashSet::with_capacity(fingerprints.len());
        for (file, checksum) in fingerprints {
            present.insert(file.relative_path.clone());
            let checksum = match checksum {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!(path = %file.relative_path, error = %e, "Skipping unreadable file");
                    report.skipped += 1;
                    continue;
                }
            };

            let Some(change) = classify(known.get(&file.relative_path), &checksum, force) else {
                report.unchanged += 1;
                continue;
            };
            self.state
                .upsert_file(&IndexedFile::discovered(
                    &repository.id,
                    &file.relative_path,
                    file.size,
                ))
                .await?;
            self.state
                .enqueue(&FileTask::new(&repository.id, &file.relative_path, change))
                .await?;
            debug!(path = %file.relative_path, %change, "Queued file");
            match change {
                ChangeKind::Create => report.created += 1,
                _ => report.updated += 1,
            }
        }

        for file in known.values() {
            if file.is_tombstone() || present.contains(&file.path) {
                continue;
            }
            self.state
                .enqueue(&FileTask::new(&repository.id, &file.path, ChangeKind::Delete))
                .await?;
            debug!(path = %file.path, "Queued deletion");
            report.deleted += 1;
        }

        self.state
            .mark_repository_scanned(&repository.id, started_at)
            .await?;
        info!(
            repository = %repository.name,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            skipped = report.skipped,
            "Scan complete"
        );
        Ok(report)
    }
}

/// What a scan should queue for a file found on disk
///
/// A stored checksum is that of the last content an attempt read, so a failed
/// file is requeued once it is edited. Files never read carry no checksum:
/// pending ones are already queued and ones that failed before reading belong
/// to the retry loop, so neither is queued again unless forced.
fn classify(existing: Option<&IndexedFile>, checksum: &str, force: bool) -> Option<ChangeKind> {
    let Some(existing) = existing else {
        return Some(ChangeKind::Create);
    };
    if existing.is_tombstone() {
        return Some(ChangeKind::Update);
    }
    match existing.checksum.as_deref() {
        Some(stored) if stored != checksum => Some(ChangeKind::Update),
        _ if force => Some(ChangeKind::Update),
        _ => None,
    }
}

/// Walk `root` and return the selected files plus the number skipped for size
async fn discover_files(
    root: PathBuf,
    filter: Arc<FileFilter>,
) -> Result<(Vec<DiscoveredFile>, usize)> {
    tokio::task::spawn_blocking(move || walk(&root, &filter))
        .await
        .context("File discovery task failed")
}

fn walk(root: &Path, filter: &FileFilter) -> (Vec<DiscoveredFile>, usize) {
    let respect_gitignore = filter.respect_gitignore();
    let walker = WalkBuilder::new(root)
        .standard_filters(true)
        .hidden(false)
        .git_ignore(respect_gitignore)
        .git_global(respect_gitignore)
        .git_exclude(respect_gitignore)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    let mut files = Vec::new();
    let mut skipped = 0;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error reading directory entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.is_included(&relative) {
            continue;
        }
        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!(path = %relative, "Failed to read metadata: {e}");
                skipped += 1;
                continue;
            }
        };
        if !filter.within_size_limit(size) {
            debug!(path = %relative, size, "Skipping file over size limit");
            skipped += 1;
            continue;
        }
        files.push(DiscoveredFile {
            relative_path: relative,
            size,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    (files, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::{FileStatus, FilesConfig};
    use codeweave_storage::StorageHandles;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (StorageHandles, ChangeScanner, Repository) {
        let storage = StorageHandles::memory();
        let repo = Repository::new("backend", dir.path(), "main");
        storage.state.upsert_repository(&repo).await.unwrap();
        let filter = FileFilter::from_config(&FilesConfig::default()).unwrap();
        let scanner = ChangeScanner::new(storage.state.clone(), Arc::new(filter));
        (storage, scanner, repo)
    }

    #[test]
    fn test_classify() {
        let mut file = IndexedFile::discovered("repo", "a.py", 1);
        assert_eq!(classify(None, "abc", false), Some(ChangeKind::Create));

        // never completed
        assert_eq!(classify(Some(&file), "abc", false), None);
        assert_eq!(classify(Some(&file), "abc", true), Some(ChangeKind::Update));

        file.checksum = Some("abc".to_string());
        file.status = FileStatus::Indexed;
        assert_eq!(classify(Some(&file), "abc", false), None);
        assert_eq!(classify(Some(&file), "def", false), Some(ChangeKind::Update));

        file.status = FileStatus::Deleted;
        assert_eq!(classify(Some(&file), "abc", false), Some(ChangeKind::Update));
    }

    #[tokio::test]
    async fn test_first_scan_queues_selected_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg/__pycache__")).unwrap();
        std::fs::write(dir.path().join("a.py"), "def foo(): pass\n").unwrap();
        std::fs::write(dir.path().join("pkg/b.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("pkg/__pycache__/b.py"), "junk").unwrap();
        std::fs::write(dir.path().join("README.md"), "# readme").unwrap();

        let (storage, scanner, repo) = setup(&dir).await;
        let report = scanner.scan(&repo).await.unwrap();

        assert_eq!(
            report,
            ScanReport {
                created: 2,
                ..ScanReport::default()
            }
        );
        assert_eq!(storage.state.queue_len().await.unwrap(), 2);
        let stored = storage.state.get_repository(&repo.id).await.unwrap().unwrap();
        assert!(stored.last_scan_at.is_some());
    }

    #[tokio::test]
    async fn test_rescan_detects_modification_and_deletion() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "a = 1\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "b = 1\n").unwrap();
        std::fs::write(dir.path().join("c.py"), "c = 1\n").unwrap();

        let (storage, scanner, repo) = setup(&dir).await;
        scanner.scan(&repo).await.unwrap();

        // Pretend everything was indexed
        while let Some(queued) = storage.state.dequeue_next().await.unwrap() {
            let id = &queued.task.file_id;
            let path = dir.path().join(&queued.task.path);
            let checksum = content_checksum(&std::fs::read(path).unwrap());
            storage.state.claim_file(id).await.unwrap();
            storage.state.complete_file(id, Some(&checksum), 6).await.unwrap();
            storage.state.mark_done(&queued.queue_id).await.unwrap();
        }

        std::fs::write(dir.path().join("a.py"), "a = 2\n").unwrap();
        std::fs::remove_file(dir.path().join("b.py")).unwrap();

        let report = scanner.scan(&repo).await.unwrap();
        assert_eq!(
            report,
            ScanReport {
                updated: 1,
                deleted: 1,
                unchanged: 1,
                ..ScanReport::default()
            }
        );

        let mut changes = Vec::new();
        while let Some(queued) = storage.state.dequeue_next().await.unwrap() {
            changes.push((queued.task.path.clone(), queued.task.change));
            storage.state.mark_done(&queued.queue_id).await.unwrap();
        }
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            changes,
            vec![
                ("a.py".to_string(), ChangeKind::Update),
                ("b.py".to_string(), ChangeKind::Delete)
            ]
        );
    }

    #[tokio::test]
    async fn test_gitignored_and_oversized_files_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "generated.py\n").unwrap();
        std::fs::write(dir.path().join("generated.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("big.py"), "#".repeat(2048)).unwrap();
        std::fs::write(dir.path().join("ok.py"), "y = 1\n").unwrap();

        let storage = StorageHandles::memory();
        let repo = Repository::new("backend", dir.path(), "main");
        storage.state.upsert_repository(&repo).await.unwrap();
        let config = FilesConfig {
            max_file_size_kb: 1,
            ..FilesConfig::default()
        };
        let filter = FileFilter::from_config(&config).unwrap();
        let scanner = ChangeScanner::new(storage.state.clone(), Arc::new(filter));

        let report = scanner.scan(&repo).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        let files = storage.state.list_files(&repo.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "ok.py");
    }

    #[tokio::test]
    async fn test_missing_root_fails_without_marking_scanned() {
        let storage = StorageHandles::memory();
        let repo = Repository::new("ghost", "/definitely/not/here", "main");
        storage.state.upsert_repository(&repo).await.unwrap();
        let filter = FileFilter::from_config(&FilesConfig::default()).unwrap();
        let scanner = ChangeScanner::new(storage.state.clone(), Arc::new(filter));

        assert!(scanner.scan(&repo).await.is_err());
        let stored = storage.state.get_repository(&repo.id).await.unwrap().unwrap();
        assert_eq!(stored.last_scan_at, None);
    }
}
