use crate::{after, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codeweave_core::{
    ChangeKind, Error, FileStatus, FileStatusCounts, FileTask, IndexedFile, QueuedTask,
    Repository, RepositoryStats, RepositoryStatus, Result,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct QueueEntry {
    queue_id: String,
    task: FileTask,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    dequeued_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn is_waiting(&self) -> bool {
        self.dequeued_at.is_none()
    }
}

#[derive(Debug, Default)]
struct StateData {
    repositories: HashMap<String, Repository>,
    files: HashMap<String, IndexedFile>,
    queue: Vec<QueueEntry>,
}

impl StateData {
    fn repository_mut(&mut self, id: &str) -> Result<&mut Repository> {
        self.repositories
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("repository {id}")))
    }

    fn file_mut(&mut self, id: &str) -> Result<&mut IndexedFile> {
        self.files
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("file {id}")))
    }

    fn has_waiting_entry(&self, file_id: &str, except: &str) -> bool {
        self.queue
            .iter()
            .any(|e| e.is_waiting() && e.task.file_id == file_id && e.queue_id != except)
    }

    fn is_claimed(&self, file_id: &str) -> bool {
        self.files
            .get(file_id)
            .is_some_and(|f| f.status == FileStatus::Indexing)
    }

    fn is_in_flight(&self, file_id: &str) -> bool {
        self.queue
            .iter()
            .any(|e| !e.is_waiting() && e.task.file_id == file_id)
    }
}

/// State store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: Mutex<StateData>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn upsert_repository(&self, repository: &Repository) -> Result<()> {
        let mut data = self.data.lock().await;
        match data.repositories.get_mut(&repository.id) {
            Some(existing) => {
                existing.name = repository.name.clone();
                existing.root_path = repository.root_path.clone();
                existing.branch = repository.branch.clone();
                existing.depends_on = repository.depends_on.clone();
            }
            None => {
                data.repositories
                    .insert(repository.id.clone(), repository.clone());
            }
        }
        Ok(())
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        Ok(self.data.lock().await.repositories.get(id).cloned())
    }

    async fn get_repository_by_name(&self, name: &str) -> Result<Option<Repository>> {
        let data = self.data.lock().await;
        Ok(data.repositories.values().find(|r| r.name == name).cloned())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let data = self.data.lock().await;
        let mut repositories: Vec<Repository> = data.repositories.values().cloned().collect();
        repositories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repositories)
    }

    async fn update_repository_status(
        &self,
        id: &str,
        status: RepositoryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        let repository = data.repository_mut(id)?;
        repository.status = status;
        repository.last_error = error.map(str::to_string);
        Ok(())
    }

    async fn record_repository_stats(
        &self,
        id: &str,
        stats: RepositoryStats,
        status: RepositoryStatus,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        let repository = data.repository_mut(id)?;
        repository.stats = stats;
        repository.status = status;
        repository.last_indexed_at = Some(Utc::now());
        Ok(())
    }

    async fn record_reference_counts(
        &self,
        id: &str,
        relation_count: u64,
        pending_reference_count: u64,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        let repository = data.repository_mut(id)?;
        repository.stats.relation_count = relation_count;
        repository.stats.pending_reference_count = pending_reference_count;
        Ok(())
    }

    async fn mark_repository_scanned(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut data = self.data.lock().await;
        data.repository_mut(id)?.last_scan_at = Some(at);
        Ok(())
    }

    async fn upsert_file(&self, file: &IndexedFile) -> Result<IndexedFile> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let stored = match data.files.get_mut(&file.id) {
            Some(existing) if existing.status == FileStatus::Indexing => existing.clone(),
            Some(existing) => {
                existing.status = FileStatus::Pending;
                existing.language = file.language;
                existing.file_size = file.file_size;
                existing.attempts = 0;
                existing.embedding_attempts = 0;
                existing.needs_embedding = false;
                existing.last_error = None;
                existing.retry_after = None;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let mut inserted = file.clone();
                inserted.updated_at = now;
                data.files.insert(inserted.id.clone(), inserted.clone());
                inserted
            }
        };
        Ok(stored)
    }

    async fn get_file(&self, id: &str) -> Result<Option<IndexedFile>> {
        Ok(self.data.lock().await.files.get(id).cloned())
    }

    async fn get_file_by_path(
        &self,
        repository_id: &str,
        path: &str,
    ) -> Result<Option<IndexedFile>> {
        let data = self.data.lock().await;
        Ok(data
            .files
            .values()
            .find(|f| f.repository_id == repository_id && f.path == path)
            .cloned())
    }

    async fn list_files(&self, repository_id: &str) -> Result<Vec<IndexedFile>> {
        let data = self.data.lock().await;
        let mut files: Vec<IndexedFile> = data
            .files
            .values()
            .filter(|f| f.repository_id == repository_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn count_files_by_status(&self, repository_id: &str) -> Result<FileStatusCounts> {
        let data = self.data.lock().await;
        let mut counts = FileStatusCounts::default();
        for file in data.files.values().filter(|f| f.repository_id == repository_id) {
            counts.add(file.status, 1);
        }
        Ok(counts)
    }

    async fn claim_file(&self, id: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        match data.files.get_mut(id) {
            Some(file) if file.status != FileStatus::Indexing => {
                file.status = FileStatus::Indexing;
                file.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_file(&self, id: &str, checksum: Option<&str>, file_size: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        let file = data.file_mut(id)?;
        let now = Utc::now();
        file.status = FileStatus::Indexed;
        file.checksum = checksum.map(str::to_string);
        file.file_size = file_size;
        file.attempts = 0;
        file.embedding_attempts = 0;
        file.needs_embedding = false;
        file.last_error = None;
        file.retry_after = None;
        file.last_indexed_at = Some(now);
        file.updated_at = now;
        Ok(())
    }

    async fn fail_file(
        &self,
        id: &str,
        checksum: Option<&str>,
        error: &str,
    ) -> Result<IndexedFile> {
        let mut data = self.data.lock().await;
        let file = data.file_mut(id)?;
        if let Some(checksum) = checksum {
            file.checksum = Some(checksum.to_string());
            file.needs_embedding = false;
        }
        file.status = FileStatus::Failed;
        file.attempts += 1;
        file.last_error = Some(error.to_string());
        file.retry_after = None;
        file.updated_at = Utc::now();
        Ok(file.clone())
    }

    async fn mark_needs_embedding(
        &self,
        id: &str,
        checksum: Option<&str>,
        error: &str,
    ) -> Result<IndexedFile> {
        let mut data = self.data.lock().await;
        let file = data.file_mut(id)?;
        file.status = FileStatus::Failed;
        file.checksum = checksum.map(str::to_string);
        file.needs_embedding = true;
        file.embedding_attempts += 1;
        file.last_error = Some(error.to_string());
        file.retry_after = None;
        file.updated_at = Utc::now();
        Ok(file.clone())
    }

    async fn schedule_retry(&self, id: &str, retry_after: Option<DateTime<Utc>>) -> Result<()> {
        let mut data = self.data.lock().await;
        data.file_mut(id)?.retry_after = retry_after;
        Ok(())
    }

    async fn tombstone_file(&self, id: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        let file = data.file_mut(id)?;
        file.status = FileStatus::Deleted;
        file.checksum = None;
        file.needs_embedding = false;
        file.last_error = None;
        file.retry_after = None;
        file.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_failed(&self, repository_id: &str) -> Result<u64> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let mut reset = 0;
        for file in data
            .files
            .values_mut()
            .filter(|f| f.repository_id == repository_id && f.status == FileStatus::Failed)
        {
            file.status = FileStatus::Pending;
            file.attempts = 0;
            file.embedding_attempts = 0;
            file.last_error = None;
            file.retry_after = None;
            file.updated_at = now;
            reset += 1;
        }
        Ok(reset)
    }

    async fn retryable_files(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<IndexedFile>> {
        let data = self.data.lock().await;
        let mut due: Vec<IndexedFile> = data
            .files
            .values()
            .filter(|f| {
                f.status == FileStatus::Failed && f.retry_after.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.retry_after.cmp(&b.retry_after).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn recover_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let mut recovered = 0;
        for file in data
            .files
            .values_mut()
            .filter(|f| f.status == FileStatus::Indexing && f.updated_at < older_than)
        {
            file.status = FileStatus::Pending;
            file.updated_at = now;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn enqueue(&self, task: &FileTask) -> Result<bool> {
        let mut data = self.data.lock().await;
        if let Some(waiting) = data
            .queue
            .iter_mut()
            .find(|e| e.is_waiting() && e.task.file_id == task.file_id)
        {
            waiting.task.change = task.change;
            return Ok(false);
        }
        let now = Utc::now();
        data.queue.push(QueueEntry {
            queue_id: uuid::Uuid::new_v4().to_string(),
            task: task.clone(),
            enqueued_at: now,
            available_at: now,
            dequeued_at: None,
        });
        Ok(true)
    }

    async fn dequeue_next(&self) -> Result<Option<QueuedTask>> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let next = data
            .queue
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.is_waiting()
                    && e.available_at <= now
                    && !data.is_claimed(&e.task.file_id)
                    && !data.is_in_flight(&e.task.file_id)
            })
            .min_by(|(_, a), (_, b)| {
                a.available_at
                    .cmp(&b.available_at)
                    .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
            })
            .map(|(index, _)| index);

        let Some(index) = next else {
            return Ok(None);
        };
        let entry = &mut data.queue[index];
        entry.dequeued_at = Some(now);
        Ok(Some(QueuedTask {
            queue_id: entry.queue_id.clone(),
            task: entry.task.clone(),
            enqueued_at: entry.enqueued_at,
        }))
    }

    async fn mark_done(&self, queue_id: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.queue.retain(|e| e.queue_id != queue_id);
        Ok(())
    }

    async fn requeue(&self, queue_id: &str, delay: Duration) -> Result<()> {
        let mut data = self.data.lock().await;
        let Some(position) = data.queue.iter().position(|e| e.queue_id == queue_id) else {
            return Ok(());
        };
        let file_id = data.queue[position].task.file_id.clone();
        if data.has_waiting_entry(&file_id, queue_id) {
            data.queue.remove(position);
            return Ok(());
        }
        let entry = &mut data.queue[position];
        entry.dequeued_at = None;
        entry.available_at = after(Utc::now(), delay);
        Ok(())
    }

    async fn queue_len(&self) -> Result<u64> {
        let data = self.data.lock().await;
        Ok(data.queue.iter().filter(|e| e.is_waiting()).count() as u64)
    }

    async fn recover_stale_dequeues(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut data = self.data.lock().await;
        let stale: Vec<String> = data
            .queue
            .iter()
            .filter(|e| e.dequeued_at.is_some_and(|at| at < older_than))
            .map(|e| e.queue_id.clone())
            .collect();
        let now = Utc::now();
        for queue_id in &stale {
            let Some(position) = data.queue.iter().position(|e| &e.queue_id == queue_id) else {
                continue;
            };
            let file_id = data.queue[position].task.file_id.clone();
            if data.has_waiting_entry(&file_id, queue_id) {
                data.queue.remove(position);
            } else {
                let entry = &mut data.queue[position];
                entry.dequeued_at = None;
                entry.available_at = now;
            }
        }
        Ok(stale.len() as u64)
    }

    async fn requeue_orphans(&self) -> Result<u64> {
        let mut data = self.data.lock().await;
        let orphans: Vec<FileTask> = data
            .files
            .values()
            .filter(|f| f.status == FileStatus::Pending)
            .filter(|f| !data.queue.iter().any(|e| e.task.file_id == f.id))
            .map(|f| {
                let change = if f.checksum.is_some() {
                    ChangeKind::Update
                } else {
                    ChangeKind::Create
                };
                FileTask::new(&f.repository_id, &f.path, change)
            })
            .collect();
        let now = Utc::now();
        for task in &orphans {
            data.queue.push(QueueEntry {
                queue_id: uuid::Uuid::new_v4().to_string(),
                task: task.clone(),
                enqueued_at: now,
                available_at: now,
                dequeued_at: None,
            });
        }
        Ok(orphans.len() as u64)
    }
}
