//! notify-backed watcher over several repository roots

use crate::debouncer::EventDebouncer;
use crate::events::RepositoryEvent;
use crate::ignore::IgnoreFilter;
use codeweave_core::{ChangeKind, Error, Result, WatcherConfig};
use notify::event::ModifyKind;
use notify::{
    Config as NotifyConfig, Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode,
    Watcher as NotifyWatcher,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Capacity of the raw and debounced event channels
const EVENT_QUEUE_SIZE: usize = 4096;

struct WatchedRoot {
    repository_id: String,
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

/// Watches repository roots and emits debounced, repository-relative changes
pub struct RepositoryWatcher {
    ignore_filter: Arc<IgnoreFilter>,
    debouncer: Arc<EventDebouncer>,
    roots: Vec<WatchedRoot>,
    cancellation_token: CancellationToken,
}

impl RepositoryWatcher {
    /// Create a watcher and the receiving end of its event stream
    pub fn new(config: &WatcherConfig) -> Result<(Self, mpsc::Receiver<RepositoryEvent>)> {
        let ignore_filter = IgnoreFilter::from_patterns(&config.ignore_patterns)?;
        let (output_tx, output_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let debouncer = EventDebouncer::new(Duration::from_millis(config.debounce_ms), output_tx);

        Ok((
            Self {
                ignore_filter: Arc::new(ignore_filter),
                debouncer: Arc::new(debouncer),
                roots: Vec::new(),
                cancellation_token: CancellationToken::new(),
            },
            output_rx,
        ))
    }

    /// Start watching `root` recursively on behalf of `repository_id`
    pub async fn watch(&mut self, repository_id: &str, root: &Path) -> Result<()> {
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| Error::watcher(format!("Cannot watch {}: {e}", root.display())))?;

        let (notify_tx, notify_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let mut watcher = create_notify_watcher(notify_tx)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::watcher(format!("Failed to watch path {root:?}: {e}")))?;

        self.start_event_processor(repository_id.to_string(), root.clone(), notify_rx);
        info!(repository_id, root = %root.display(), "Watching repository");

        self.roots.push(WatchedRoot {
            repository_id: repository_id.to_string(),
            root,
            _watcher: watcher,
        });
        Ok(())
    }

    fn start_event_processor(
        &self,
        repository_id: String,
        root: PathBuf,
        mut notify_rx: mpsc::Receiver<NotifyEvent>,
    ) {
        let ignore_filter = Arc::clone(&self.ignore_filter);
        let debouncer = Arc::clone(&self.debouncer);
        let cancel_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    event = notify_rx.recv() => {
                        let Some(event) = event else { break };
                        trace!(?event, "Received notify event");
                        for (path, change) in classify(&event).await {
                            let Some(relative) = relative_path(&root, &path) else {
                                continue;
                            };
                            if ignore_filter.should_ignore(Path::new(&relative)) {
                                continue;
                            }
                            debouncer.process(&repository_id, &relative, change);
                        }
                    }
                }
            }
            debug!(repository_id = %repository_id, "Event processor stopped");
        });
    }

    /// Repository ids and canonical roots currently watched
    pub fn watched(&self) -> Vec<(String, PathBuf)> {
        self.roots
            .iter()
            .map(|r| (r.repository_id.clone(), r.root.clone()))
            .collect()
    }

    /// Stop every watch and emit changes still waiting in the debouncer
    pub async fn stop(&mut self) {
        self.cancellation_token.cancel();
        self.roots.clear();
        self.debouncer.flush().await;
        info!("File watcher stopped");
    }
}

fn create_notify_watcher(tx: mpsc::Sender<NotifyEvent>) -> Result<RecommendedWatcher> {
    RecommendedWatcher::new(
        move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                if let Err(e) = tx.try_send(event) {
                    error!("Failed to send notify event: {e}");
                }
            }
            Err(e) => error!("Notify error: {e}"),
        },
        NotifyConfig::default(),
    )
    .map_err(|e| Error::watcher(format!("Failed to create watcher: {e}")))
}

/// Map a raw notify event to per-file changes
///
/// Directories and access events are dropped. Renames become a delete of the
/// old path and a create of the new one, judged by what exists on disk now.
async fn classify(event: &NotifyEvent) -> Vec<(PathBuf, ChangeKind)> {
    let mut changes = Vec::new();
    for path in &event.paths {
        let is_file = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        let change = match event.kind {
            EventKind::Create(_) if is_file => ChangeKind::Create,
            EventKind::Modify(ModifyKind::Name(_)) if is_file => ChangeKind::Create,
            EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Delete,
            EventKind::Modify(_) if is_file => ChangeKind::Update,
            EventKind::Remove(_) => ChangeKind::Delete,
            _ => continue,
        };
        changes.push((path.clone(), change));
    }
    changes
}

/// `root`-relative, `/`-separated form of `path`
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
