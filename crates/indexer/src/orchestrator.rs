//! Lifecycle of the indexing service
//!
//! Startup reconciles the configured repositories, sweeps up state left by a
//! crash and scans every repository. Four background loops then run until
//! shutdown:
//!
//! - **backlog**: dequeues file tasks and indexes them, bounded by
//!   `indexing.max_workers`
//! - **retry**: re-enqueues failed files whose backoff expired and re-embeds
//!   files that only lack vectors
//! - **resolver**: binds pending references ([`codeweave_resolver::start_resolver`])
//! - **watch**: routes file system events onto the queue
//!
//! Each loop tracks consecutive storage failures in a [`LoopHealth`].

use crate::event_batcher::EventBatcher;
use crate::event_router::EventRouter;
use crate::failure_policy::{backoff_delay, FailurePolicy};
use crate::filter::FileFilter;
use crate::pipeline::{IndexOutcome, IndexingPipeline};
use crate::query::{QueryService, RepositoryStatusReport};
use crate::scanner::{ChangeScanner, ScanReport};
use crate::stats::StatsUpdater;
use chrono::Utc;
use codeweave_core::{
    ChangeKind, Config, Error, Extractor, FileTask, HealthStatus, LoopHealth, QueuedTask,
    Repository, RepositoryStatus, Result, WatcherConfig,
};
use codeweave_embeddings::EmbeddingManager;
use codeweave_resolver::{start_resolver, ReferenceResolver, ResolutionStats};
use codeweave_storage::{StateStore, StorageHandles};
use codeweave_watcher::{detect_branch, RepositoryEvent, RepositoryWatcher};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Upper bound on the backoff of a loop hitting storage errors
const MAX_LOOP_BACKOFF: Duration = Duration::from_secs(30);

/// Failed files re-enqueued per retry pass
const RETRY_BATCH_SIZE: usize = 100;

/// Distinct files collected before routing a batch of watcher events
const WATCH_BATCH_SIZE: usize = 64;

/// Longest a watcher event waits in an incomplete batch
const WATCH_BATCH_TIMEOUT_MS: u64 = 250;

/// What the crash-recovery sweep found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub stale_claims: u64,
    pub stale_dequeues: u64,
    pub orphans: u64,
    pub repositories_reset: usize,
}

/// Outcome counters of draining the queue once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub indexed: usize,
    pub reembedded: usize,
    pub deleted: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub errors: usize,
}

impl DrainReport {
    fn record(&mut self, result: &Result<IndexOutcome>) {
        match result {
            Ok(IndexOutcome::Indexed { .. }) => self.indexed += 1,
            Ok(IndexOutcome::Reembedded { .. }) => self.reembedded += 1,
            Ok(IndexOutcome::Deleted { .. }) => self.deleted += 1,
            Ok(IndexOutcome::Failed { .. }) => self.failed += 1,
            Ok(IndexOutcome::AlreadyInProgress) => self.in_progress += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Result of a one-shot indexing run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scans: Vec<(String, ScanReport)>,
    pub drain: DrainReport,
    #[serde(skip)]
    pub resolution: ResolutionStats,
}

/// Loop health together with the per-repository index status
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub health: HealthStatus,
    pub repositories: Vec<RepositoryStatusReport>,
}

struct LoopHealths {
    backlog: Arc<LoopHealth>,
    retry: Arc<LoopHealth>,
    resolver: Arc<LoopHealth>,
    watch: Arc<LoopHealth>,
}

impl LoopHealths {
    fn new(threshold: u32) -> Self {
        Self {
            backlog: Arc::new(LoopHealth::new("backlog", threshold)),
            retry: Arc::new(LoopHealth::new("retry", threshold)),
            resolver: Arc::new(LoopHealth::new("resolver", threshold)),
            watch: Arc::new(LoopHealth::new("watch", threshold)),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &LoopHealth> {
        [&self.backlog, &self.retry, &self.resolver, &self.watch]
            .into_iter()
            .map(|h| &**h)
    }
}

/// Owns the components and background loops of the indexing service
pub struct Orchestrator {
    config: Config,
    storage: StorageHandles,
    scanner: ChangeScanner,
    router: EventRouter,
    stats: StatsUpdater,
    pipeline: Arc<IndexingPipeline>,
    resolver: Arc<ReferenceResolver>,
    query: Arc<QueryService>,
    health: LoopHealths,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire the components for `config` on top of connected storage
    ///
    /// # Errors
    /// Returns a configuration error for invalid file patterns
    pub fn new(
        config: Config,
        storage: StorageHandles,
        extractor: Arc<dyn Extractor>,
        embeddings: Arc<EmbeddingManager>,
    ) -> Result<Self> {
        let filter = Arc::new(FileFilter::from_config(&config.files)?);
        let scanner = ChangeScanner::new(Arc::clone(&storage.state), Arc::clone(&filter));
        let router = EventRouter::new(Arc::clone(&storage.state), filter);
        let resolver = Arc::new(ReferenceResolver::new(
            Arc::clone(&storage.graph),
            Arc::clone(&storage.state),
            &config.resolution,
        ));
        let pipeline = Arc::new(IndexingPipeline::new(
            &storage,
            extractor,
            Arc::clone(&embeddings),
            Arc::clone(&resolver),
            FailurePolicy::from_config(&config.indexing),
        ));
        let query = Arc::new(QueryService::new(&storage, embeddings, scanner.clone()));
        let stats = StatsUpdater::new(Arc::clone(&storage.state), Arc::clone(&storage.graph));
        let health = LoopHealths::new(config.indexing.reconnect_attempts);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            storage,
            scanner,
            router,
            stats,
            pipeline,
            resolver,
            query,
            health,
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn storage(&self) -> &StorageHandles {
        &self.storage
    }

    pub fn pipeline(&self) -> Arc<IndexingPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn resolver(&self) -> Arc<ReferenceResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn query(&self) -> Arc<QueryService> {
        Arc::clone(&self.query)
    }

    /// Aggregate health of the background loops
    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_loops(self.health.iter())
    }

    /// Health of the loops plus the index status of `repository`, or of every
    /// repository when `None`
    pub async fn status(&self, repository: Option<&str>) -> Result<ServiceStatus> {
        let repositories = self.query.get_index_status(repository).await?;
        Ok(ServiceStatus {
            health: self.health(),
            repositories,
        })
    }

    /// Store the configured repositories
    ///
    /// Configured identity (path, branch, dependencies) is updated; status and
    /// statistics of known repositories are kept. Repositories that are no
    /// longer configured keep their index.
    ///
    /// # Returns
    /// The configured repositories as stored
    pub async fn reconcile_repositories(&self) -> Result<Vec<Repository>> {
        let mut repositories = Vec::with_capacity(self.config.repositories.len());
        for configured in &self.config.repositories {
            let mut repository =
                Repository::new(&configured.name, &configured.path, &configured.branch);
            repository.depends_on = configured.depends_on.clone();

            if let Some(checked_out) = detect_branch(&configured.path) {
                if checked_out != configured.branch {
                    warn!(
                        repository = %configured.name,
                        configured = %configured.branch,
                        checked_out = %checked_out,
                        "Checked-out branch differs from configured branch"
                    );
                }
            }

            self.storage.state.upsert_repository(&repository).await?;
            let stored = self
                .storage
                .state
                .get_repository(&repository.id)
                .await?
                .unwrap_or(repository);
            repositories.push(stored);
        }

        let configured: HashSet<&str> = self
            .config
            .repositories
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        for stored in self.storage.state.list_repositories().await? {
            if !configured.contains(stored.name.as_str()) {
                info!(repository = %stored.name, "Repository no longer configured; keeping its index");
            }
        }
        Ok(repositories)
    }

    /// Undo the effects of a crash: stale claims, stale dequeues, pending files
    /// missing from the queue and repositories stuck in `indexing`
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let state = &self.storage.state;
        let (stale_claims, stale_dequeues) =
            sweep_stale(state.as_ref(), self.config.indexing.stale_claim_after()).await?;
        let orphans = state.requeue_orphans().await?;

        let mut repositories_reset = 0;
        for repository in state.list_repositories().await? {
            if repository.status == RepositoryStatus::Indexing {
                self.stats.refresh(&repository.id).await?;
                repositories_reset += 1;
            }
        }

        let report = RecoveryReport {
            stale_claims,
            stale_dequeues,
            orphans,
            repositories_reset,
        };
        if report != RecoveryReport::default() {
            info!(
                stale_claims,
                stale_dequeues, orphans, repositories_reset, "Recovered from unclean shutdown"
            );
        }
        Ok(report)
    }

    /// Scan every given repository, marking the ones that cannot be scanned as failed
    ///
    /// # Errors
    /// Only storage errors abort the sweep
    pub async fn scan_all(&self, repositories: &[Repository]) -> Result<Vec<(String, ScanReport)>> {
        let mut reports = Vec::with_capacity(repositories.len());
        for repository in repositories {
            self.storage
                .state
                .update_repository_status(&repository.id, RepositoryStatus::Indexing, None)
                .await?;
            match self.scanner.scan(repository).await {
                Ok(report) => {
                    self.stats.refresh(&repository.id).await?;
                    reports.push((repository.name.clone(), report));
                }
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    error!(repository = %repository.name, "Scan failed: {e}");
                    self.storage
                        .state
                        .update_repository_status(
                            &repository.id,
                            RepositoryStatus::Failed,
                            Some(&e.to_string()),
                        )
                        .await?;
                }
            }
        }
        Ok(reports)
    }

    /// Reconcile, recover and scan
    pub async fn prepare(&self) -> Result<Vec<Repository>> {
        let repositories = self.reconcile_repositories().await?;
        self.recover().await?;
        self.scan_all(&repositories).await?;
        Ok(repositories)
    }

    /// Process queued tasks until the queue has nothing available
    ///
    /// Tasks scheduled for a later retry stay behind.
    pub async fn drain_backlog(&self) -> Result<DrainReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.indexing.max_workers.max(1)));
        let worker = self.queue_worker();
        let mut in_flight: JoinSet<Result<IndexOutcome>> = JoinSet::new();
        let mut report = DrainReport::default();

        loop {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::with_context("Worker semaphore closed", e))?;
            match self.storage.state.dequeue_next().await? {
                Some(queued) => {
                    let worker = worker.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.process(queued).await
                    });
                }
                None => {
                    drop(permit);
                    match in_flight.join_next().await {
                        Some(Ok(result)) => report.record(&result),
                        Some(Err(e)) => {
                            error!("Indexing task failed: {e}");
                            report.errors += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            indexed = report.indexed,
            reembedded = report.reembedded,
            deleted = report.deleted,
            failed = report.failed,
            errors = report.errors,
            "Backlog drained"
        );
        Ok(report)
    }

    /// Re-enqueue failed files whose backoff expired
    ///
    /// # Returns
    /// Number of files retried
    pub async fn retry_due(&self) -> Result<usize> {
        retry_due_files(self.storage.state.as_ref(), &self.pipeline).await
    }

    /// Index everything once: prepare, drain the queue, run one resolver pass
    pub async fn run_once(&self) -> Result<RunReport> {
        let repositories = self.reconcile_repositories().await?;
        self.recover().await?;
        let scans = self.scan_all(&repositories).await?;
        let drain = self.drain_backlog().await?;
        let resolution = self
            .resolver
            .resolve_batch(self.config.resolution.batch_size.max(1))
            .await?;
        // Repositories whose scan failed keep their failed status
        for repository in &repositories {
            if scans.iter().any(|(name, _)| *name == repository.name) {
                self.stats.refresh(&repository.id).await?;
            }
        }
        Ok(RunReport {
            scans,
            drain,
            resolution,
        })
    }

    /// Prepare and start the background loops
    pub async fn start(&self) -> Result<()> {
        let repositories = self.prepare().await?;
        let indexing = &self.config.indexing;
        let mut loops = self.loops.lock().await;

        let backlog = BacklogLoop {
            state: Arc::clone(&self.storage.state),
            worker: self.queue_worker(),
            semaphore: Arc::new(Semaphore::new(indexing.max_workers.max(1))),
            health: Arc::clone(&self.health.backlog),
            poll_interval: indexing.poll_interval(),
            shutdown_grace: indexing.shutdown_grace(),
        };
        loops.push(tokio::spawn(backlog.run(self.shutdown_tx.subscribe())));

        loops.push(tokio::spawn(run_retry_loop(
            Arc::clone(&self.storage.state),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.health.retry),
            indexing.retry_interval(),
            indexing.stale_claim_after(),
            self.shutdown_tx.subscribe(),
        )));

        let resolver = Arc::clone(&self.resolver);
        let resolution = self.config.resolution.clone();
        let resolver_health = Arc::clone(&self.health.resolver);
        let resolver_rx = self.shutdown_tx.subscribe();
        loops.push(tokio::spawn(async move {
            if let Err(e) = start_resolver(resolver, &resolution, resolver_health, resolver_rx).await
            {
                error!("Reference resolver stopped: {e}");
            }
        }));

        if indexing.watch {
            let watch = WatchLoop {
                router: self.router.clone(),
                config: self.config.watcher.clone(),
                health: Arc::clone(&self.health.watch),
                reconnect_attempts: indexing.reconnect_attempts.max(1),
                backoff_base: indexing.poll_interval(),
            };
            loops.push(tokio::spawn(watch.run(repositories, self.shutdown_tx.subscribe())));
        }

        info!(loops = loops.len(), "Orchestrator started");
        Ok(())
    }

    /// Stop claiming work, let in-flight files finish within the grace period,
    /// wait for every loop and close storage
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.shutdown_tx.send_replace(true);
        let loops = std::mem::take(&mut *self.loops.lock().await);
        for handle in loops {
            if let Err(e) = handle.await {
                error!("Background loop ended abnormally: {e}");
            }
        }
        self.storage.close().await;
        info!("Orchestrator stopped");
    }

    fn queue_worker(&self) -> QueueWorker {
        QueueWorker {
            state: Arc::clone(&self.storage.state),
            pipeline: Arc::clone(&self.pipeline),
            health: Arc::clone(&self.health.backlog),
            requeue_delay: self.config.indexing.poll_interval(),
        }
    }
}

/// Runs one dequeued task and settles its queue entry
#[derive(Clone)]
struct QueueWorker {
    state: Arc<dyn StateStore>,
    pipeline: Arc<IndexingPipeline>,
    health: Arc<LoopHealth>,
    requeue_delay: Duration,
}

impl QueueWorker {
    async fn process(&self, queued: QueuedTask) -> Result<IndexOutcome> {
        let result = self.pipeline.index_file(&queued.task).await;

        // Contended files and storage failures go back on the queue; anything
        // else is settled, the file row carries the outcome
        let settled = match &result {
            Ok(IndexOutcome::AlreadyInProgress) => {
                self.state.requeue(&queued.queue_id, self.requeue_delay).await
            }
            Err(e) if e.is_storage() => {
                self.state.requeue(&queued.queue_id, self.requeue_delay).await
            }
            _ => self.state.mark_done(&queued.queue_id).await,
        };
        if let Err(e) = settled {
            error!(queue_id = %queued.queue_id, error = %e, "Failed to settle queue entry");
            self.health.record_failure();
        }

        match &result {
            Err(e) if e.is_storage() => {
                error!(path = %queued.task.path, "Storage error while indexing: {e}");
                self.health.record_failure();
            }
            Err(e) => warn!(path = %queued.task.path, error = %e, "Dropped file task"),
            Ok(_) => {}
        }
        result
    }
}

struct BacklogLoop {
    state: Arc<dyn StateStore>,
    worker: QueueWorker,
    semaphore: Arc<Semaphore>,
    health: Arc<LoopHealth>,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl BacklogLoop {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();
        info!("Backlog drain started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                Some(done) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    reap(&mut running, done);
                    continue;
                }
                _ = shutdown_rx.changed() => break,
            };

            match self.state.dequeue_next().await {
                Ok(Some(queued)) => {
                    self.health.record_success();
                    let file_id = queued.task.file_id.clone();
                    let worker = self.worker.clone();
                    let handle = in_flight.spawn(async move {
                        let _permit = permit;
                        // Outcome is logged and recorded by the worker
                        let _ = worker.process(queued).await;
                    });
                    running.insert(handle.id(), file_id);
                }
                Ok(None) => {
                    drop(permit);
                    self.health.record_success();
                    tokio::select! {
                        _ = sleep(self.poll_interval) => {},
                        _ = shutdown_rx.changed() => {},
                    }
                }
                Err(e) => {
                    drop(permit);
                    let failures = self.health.record_failure();
                    error!("Backlog drain error: {e}");
                    let delay = backoff_delay(self.poll_interval, MAX_LOOP_BACKOFF, failures);
                    tokio::select! {
                        _ = sleep(delay) => {},
                        _ = shutdown_rx.changed() => {},
                    }
                }
            }
        }

        info!(in_flight = running.len(), "Backlog drain stopping; waiting for in-flight files");
        let finished = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(done) = in_flight.join_next_with_id().await {
                reap(&mut running, done);
            }
        })
        .await;

        if finished.is_err() {
            in_flight.abort_all();
            // Tasks that finished before the abort landed are reaped normally;
            // only cancelled ones left their file mid-flight
            while let Some(done) = in_flight.join_next_with_id().await {
                match done {
                    Err(e) if e.is_cancelled() => {
                        if let Some(file_id) = running.remove(&e.id()) {
                            self.release_interrupted(&file_id).await;
                        }
                    }
                    done => reap(&mut running, done),
                }
            }
        }
        info!("Backlog drain stopped");
    }

    /// Mark a file abandoned at shutdown as failed and due for retry
    async fn release_interrupted(&self, file_id: &str) {
        let result = async {
            self.state
                .fail_file(file_id, None, "Interrupted by shutdown")
                .await?;
            self.state.schedule_retry(file_id, Some(Utc::now())).await
        }
        .await;
        match result {
            Ok(()) => warn!(file_id, "Indexing interrupted by shutdown; will retry"),
            Err(e) => error!(file_id, error = %e, "Failed to release interrupted file"),
        }
    }
}

fn reap(
    running: &mut HashMap<tokio::task::Id, String>,
    done: std::result::Result<(tokio::task::Id, ()), JoinError>,
) {
    match done {
        Ok((id, ())) => {
            running.remove(&id);
        }
        Err(e) => {
            if let Some(file_id) = running.remove(&e.id()) {
                error!(file_id = %file_id, "Indexing task failed: {e}");
            }
        }
    }
}

/// Claims and dequeues older than this are considered abandoned
async fn sweep_stale(state: &dyn StateStore, stale_after: Duration) -> Result<(u64, u64)> {
    let stale_after = chrono::Duration::from_std(stale_after)
        .map_err(|e| Error::config(format!("Invalid stale claim period: {e}")))?;
    let older_than = Utc::now() - stale_after;
    let claims = state.recover_stale_claims(older_than).await?;
    let dequeues = state.recover_stale_dequeues(older_than).await?;
    Ok((claims, dequeues))
}

async fn retry_due_files(state: &dyn StateStore, pipeline: &IndexingPipeline) -> Result<usize> {
    let due = state.retryable_files(Utc::now(), RETRY_BATCH_SIZE).await?;
    for file in &due {
        state.schedule_retry(&file.id, None).await?;
        if file.needs_embedding {
            match pipeline.reembed_file(&file.id).await {
                Ok(outcome) => debug!(path = %file.path, ?outcome, "Retried embeddings"),
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => warn!(path = %file.path, error = %e, "Re-embedding failed"),
            }
        } else {
            state
                .enqueue(&FileTask::new(
                    &file.repository_id,
                    &file.path,
                    ChangeKind::Update,
                ))
                .await?;
        }
    }
    if !due.is_empty() {
        info!(files = due.len(), "Retrying failed files");
    }
    Ok(due.len())
}

async fn run_retry_loop(
    state: Arc<dyn StateStore>,
    pipeline: Arc<IndexingPipeline>,
    health: Arc<LoopHealth>,
    interval: Duration,
    stale_after: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Retry loop started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let pass = async {
            // Claims abandoned by a crashed peer are swept here too
            sweep_stale(state.as_ref(), stale_after).await?;
            retry_due_files(state.as_ref(), &pipeline).await
        }
        .await;
        let delay = match pass {
            Ok(_) => {
                health.record_success();
                interval
            }
            Err(e) => {
                let failures = health.record_failure();
                error!("Retry pass error: {e}");
                backoff_delay(Duration::from_secs(1), interval, failures)
            }
        };

        tokio::select! {
            _ = sleep(delay) => {},
            _ = shutdown_rx.changed() => break,
        }
    }
    info!("Retry loop stopped");
}

struct WatchLoop {
    router: EventRouter,
    config: WatcherConfig,
    health: Arc<LoopHealth>,
    reconnect_attempts: u32,
    backoff_base: Duration,
}

impl WatchLoop {
    async fn run(self, repositories: Vec<Repository>, mut shutdown_rx: watch::Receiver<bool>) {
        let (mut watcher, mut events) = match RepositoryWatcher::new(&self.config) {
            Ok(created) => created,
            Err(e) => {
                error!("Failed to start file watcher: {e}");
                return;
            }
        };
        for repository in &repositories {
            if let Err(e) = watcher.watch(&repository.id, &repository.root_path).await {
                warn!(repository = %repository.name, "Not watching repository: {e}");
            }
        }

        let mut batcher = EventBatcher::new(WATCH_BATCH_SIZE, WATCH_BATCH_TIMEOUT_MS);
        let mut flush_tick = tokio::time::interval(batcher.timeout());
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(batch) = batcher.push(event) {
                        self.route_batch(batch).await;
                    }
                }
                _ = flush_tick.tick() => {
                    if !batcher.is_empty() {
                        self.route_batch(batcher.flush()).await;
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        watcher.stop().await;
        while let Ok(event) = events.try_recv() {
            if let Some(batch) = batcher.push(event) {
                self.route_batch(batch).await;
            }
        }
        self.route_batch(batcher.flush()).await;
        info!("Watch loop stopped");
    }

    /// Route each event, backing off on storage errors
    ///
    /// An event still failing after the reconnect budget is dropped; the
    /// next scan picks the change up.
    async fn route_batch(&self, batch: Vec<RepositoryEvent>) {
        for event in batch {
            let mut attempt = 0;
            loop {
                match self.router.route(&event).await {
                    Ok(_) => {
                        self.health.record_success();
                        break;
                    }
                    Err(e) if e.is_storage() => {
                        let failures = self.health.record_failure();
                        attempt += 1;
                        if attempt >= self.reconnect_attempts {
                            error!(
                                path = %event.relative_path,
                                "Dropping file event after repeated storage errors: {e}"
                            );
                            break;
                        }
                        sleep(backoff_delay(self.backoff_base, MAX_LOOP_BACKOFF, failures)).await;
                    }
                    Err(e) => {
                        warn!(path = %event.relative_path, error = %e, "Ignoring file event");
                        break;
                    }
                }
            }
        }
    }
}
