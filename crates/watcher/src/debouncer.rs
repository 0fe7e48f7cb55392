//! Per-path debouncing of file system events
//!
//! The first event for a path starts a timer; every event for the same path
//! arriving before it fires is folded into a single change.

use crate::events::{PendingChange, RepositoryEvent};
use codeweave_core::ChangeKind;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace};

type PathKey = (String, String);

/// Collapses bursts of events per (repository, path)
pub struct EventDebouncer {
    debounce_duration: Duration,
    pending: Arc<DashMap<PathKey, PendingChange>>,
    output_tx: mpsc::Sender<RepositoryEvent>,
}

impl EventDebouncer {
    pub fn new(debounce_duration: Duration, output_tx: mpsc::Sender<RepositoryEvent>) -> Self {
        Self {
            debounce_duration,
            pending: Arc::new(DashMap::new()),
            output_tx,
        }
    }

    /// Record a raw change; emits once the path has been quiet for the window
    pub fn process(&self, repository_id: &str, relative_path: &str, change: ChangeKind) {
        let key = (repository_id.to_string(), relative_path.to_string());

        self.pending
            .entry(key.clone())
            .and_modify(|p| {
                trace!(path = relative_path, %change, "Folding change into pending event");
                p.update(change);
            })
            .or_insert_with(|| {
                let pending = Arc::clone(&self.pending);
                let output_tx = self.output_tx.clone();
                let window = self.debounce_duration;

                tokio::spawn(async move {
                    sleep(window).await;
                    if let Some(((repository_id, relative_path), change)) = pending.remove(&key) {
                        debug!(
                            repository_id = %repository_id,
                            path = %relative_path,
                            change = %change.change,
                            occurrences = change.occurrences,
                            waited_ms = change.first_seen.elapsed().as_millis() as u64,
                            "Emitting debounced change"
                        );
                        let event = RepositoryEvent::new(repository_id, relative_path, change.change);
                        let _ = output_tx.send(event).await;
                    }
                });

                PendingChange::new(change)
            });
    }

    /// Emit every pending change immediately
    pub async fn flush(&self) {
        let keys: Vec<PathKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        debug!(pending = keys.len(), "Flushing pending changes");

        for key in keys {
            if let Some(((repository_id, relative_path), change)) = self.pending.remove(&key) {
                let event = RepositoryEvent::new(repository_id, relative_path, change.change);
                let _ = self.output_tx.send(event).await;
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_burst_collapses_to_one_event() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = EventDebouncer::new(Duration::from_millis(30), tx);

        debouncer.process("repo", "a.py", ChangeKind::Create);
        debouncer.process("repo", "a.py", ChangeKind::Update);
        debouncer.process("repo", "b.py", ChangeKind::Delete);
        assert_eq!(debouncer.pending_count(), 2);

        let mut events = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        events.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        assert_eq!(
            events,
            vec![
                RepositoryEvent::new("repo", "a.py", ChangeKind::Create),
                RepositoryEvent::new("repo", "b.py", ChangeKind::Delete),
            ]
        );
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_same_path_in_different_repositories_kept_apart() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = EventDebouncer::new(Duration::from_secs(60), tx);

        debouncer.process("one", "a.py", ChangeKind::Update);
        debouncer.process("two", "a.py", ChangeKind::Update);
        debouncer.flush().await;

        let mut repositories = vec![
            rx.recv().await.unwrap().repository_id,
            rx.recv().await.unwrap().repository_id,
        ];
        repositories.sort();
        assert_eq!(repositories, vec!["one".to_string(), "two".to_string()]);
    }
}
