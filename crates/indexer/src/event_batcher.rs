//! Event batching for the watch loop
//!
//! Collects watcher events until the batch is full or its timeout expires.
//! Repeated events for the same file inside one batch collapse into one.

use codeweave_core::ChangeKind;
use codeweave_watcher::RepositoryEvent;
use std::collections::HashMap;
use std::time::Duration;

/// Batches repository events with size and timeout limits
pub struct EventBatcher {
    batch: Vec<RepositoryEvent>,
    /// Position in `batch` of the event for each (repository, path)
    positions: HashMap<(String, String), usize>,
    batch_size: usize,
    timeout: Duration,
}

impl EventBatcher {
    pub fn new(batch_size: usize, timeout_ms: u64) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch: Vec::with_capacity(batch_size),
            positions: HashMap::with_capacity(batch_size),
            batch_size,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Add an event to the batch
    ///
    /// Returns the batch once it holds `batch_size` distinct files
    pub fn push(&mut self, event: RepositoryEvent) -> Option<Vec<RepositoryEvent>> {
        let key = (event.repository_id.clone(), event.relative_path.clone());
        match self.positions.get(&key) {
            Some(&index) => {
                let previous = &mut self.batch[index];
                previous.change = merge(previous.change, event.change);
            }
            None => {
                self.positions.insert(key, self.batch.len());
                self.batch.push(event);
            }
        }

        if self.batch.len() >= self.batch_size {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Flush the current batch, returning all accumulated events
    pub fn flush(&mut self) -> Vec<RepositoryEvent> {
        self.positions.clear();
        std::mem::take(&mut self.batch)
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A file created and then modified is still new; otherwise the latest change wins
fn merge(previous: ChangeKind, next: ChangeKind) -> ChangeKind {
    match (previous, next) {
        (ChangeKind::Create, ChangeKind::Update) => ChangeKind::Create,
        (_, next) => next,
    }
}
