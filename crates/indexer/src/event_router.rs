//! Turns watcher events into queued file tasks without rescanning

use crate::filter::FileFilter;
use codeweave_core::{ChangeKind, FileTask, IndexedFile, Result};
use codeweave_storage::StateStore;
use codeweave_watcher::RepositoryEvent;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Routes individual file changes onto the durable queue
#[derive(Clone)]
pub struct EventRouter {
    state: Arc<dyn StateStore>,
    filter: Arc<FileFilter>,
}

impl EventRouter {
    pub fn new(state: Arc<dyn StateStore>, filter: Arc<FileFilter>) -> Self {
        Self { state, filter }
    }

    /// Queue the task for one event
    ///
    /// * Paths outside the include/exclude rules are ignored
    /// * A delete of a path that is back on disk (editors saving through a
    ///   rename) is handled as an update
    /// * A create or update of an unknown path registers the file as pending
    /// * A file grown past the size limit is handled as a delete
    /// * A delete of an unknown or already deleted path is ignored
    ///
    /// # Returns
    /// The queued task, or `None` when the event was ignored
    pub async fn route(&self, event: &RepositoryEvent) -> Result<Option<FileTask>> {
        let path = event.relative_path.as_str();
        if !self.filter.is_included(path) {
            trace!(path, "Event for excluded path ignored");
            return Ok(None);
        }
        let Some(repository) = self.state.get_repository(&event.repository_id).await? else {
            warn!(repository_id = %event.repository_id, path, "Event for unknown repository");
            return Ok(None);
        };

        // A file over the size limit counts as absent, as it does in a scan
        let on_disk = tokio::fs::metadata(repository.root_path.join(path))
            .await
            .ok()
            .filter(|m| m.is_file())
            .filter(|m| {
                let within = self.filter.within_size_limit(m.len());
                if !within {
                    debug!(path, size = m.len(), "File over size limit treated as removed");
                }
                within
            });
        let existing = self
            .state
            .get_file_by_path(&repository.id, path)
            .await?
            .filter(|f| !f.is_tombstone());

        let change = match (&on_disk, event.change) {
            (Some(_), ChangeKind::Delete) => ChangeKind::Update,
            (None, _) => ChangeKind::Delete,
            (Some(_), change) => change,
        };

        let task = match (change, existing) {
            (ChangeKind::Delete, None) => {
                trace!(path, "Delete of untracked path ignored");
                return Ok(None);
            }
            (ChangeKind::Delete, Some(_)) => FileTask::new(&repository.id, path, ChangeKind::Delete),
            (_, existing) => {
                let size = on_disk.as_ref().map_or(0, |m| m.len());
                self.state
                    .upsert_file(&IndexedFile::discovered(&repository.id, path, size))
                    .await?;
                let change = if existing.is_some() {
                    ChangeKind::Update
                } else {
                    ChangeKind::Create
                };
                FileTask::new(&repository.id, path, change)
            }
        };

        self.state.enqueue(&task).await?;
        debug!(repository = %repository.name, path, change = %task.change, "Queued change");
        Ok(Some(task))
    }
}
