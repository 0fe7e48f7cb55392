use crate::matching::{normalize_target, select_candidate};
use codeweave_core::{
    CodeEntity, CodeRelation, Error, PendingReference, ReferenceStatus, ResolutionConfig, Result,
};
use codeweave_storage::{RelationGraph, StateStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on suffix candidates considered for one reference
const SUFFIX_CANDIDATE_LIMIT: usize = 64;

/// How long claimed references stay hidden from a concurrent resolver
const CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Outcome counters of one resolution batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    /// References taken off the pending queue
    pub claimed: usize,
    pub resolved: usize,
    /// References that reached the attempt cap in this batch
    pub failed: usize,
    /// Unmatched references still under the cap
    pub still_pending: usize,
    /// References skipped because of a backend error
    pub errors: usize,
}

/// Binds pending references to entities once their targets are indexed
pub struct ReferenceResolver {
    graph: Arc<dyn RelationGraph>,
    state: Arc<dyn StateStore>,
    max_attempts: u32,
}

impl ReferenceResolver {
    pub fn new(
        graph: Arc<dyn RelationGraph>,
        state: Arc<dyn StateStore>,
        config: &ResolutionConfig,
    ) -> Self {
        Self {
            graph,
            state,
            max_attempts: config.max_attempts,
        }
    }

    /// Try to resolve up to `limit` pending references, oldest first
    ///
    /// Backend errors on a single reference are logged and the reference is
    /// left pending; only a failure to fetch the batch is returned.
    ///
    /// # Returns
    /// Counters for the batch
    pub async fn resolve_batch(&self, limit: usize) -> Result<ResolutionStats> {
        let references = self
            .graph
            .claim_pending_references(limit, CLAIM_LEASE)
            .await?;
        let mut stats = ResolutionStats {
            claimed: references.len(),
            ..ResolutionStats::default()
        };
        let mut touched = BTreeSet::new();

        for reference in &references {
            match self.resolve_one(reference).await {
                Ok(Some(_)) => stats.resolved += 1,
                Ok(None) => match self
                    .graph
                    .record_failed_attempt(&reference.id, self.max_attempts)
                    .await
                {
                    Ok(ReferenceStatus::Failed) => {
                        debug!(
                            target = %reference.target_qualified_name,
                            source = %reference.source_qualified_name,
                            "Reference gave up after reaching the attempt cap"
                        );
                        stats.failed += 1;
                    }
                    Ok(_) => stats.still_pending += 1,
                    Err(e) => {
                        log_resolution_error(reference, &e);
                        stats.errors += 1;
                    }
                },
                Err(e) => {
                    log_resolution_error(reference, &e);
                    stats.errors += 1;
                }
            }
            touched.insert(reference.source_repository_id.clone());
        }

        for repository_id in &touched {
            if let Err(e) = self.refresh_counts(repository_id).await {
                warn!(repository_id = %repository_id, error = %e, "Failed to refresh reference counts");
            }
        }

        if stats.resolved > 0 || stats.failed > 0 {
            info!(
                claimed = stats.claimed,
                resolved = stats.resolved,
                failed = stats.failed,
                still_pending = stats.still_pending,
                errors = stats.errors,
                "Resolution batch complete"
            );
        }
        Ok(stats)
    }

    /// Bind a freshly stored reference when its exact target is already indexed
    ///
    /// Used by the indexing pipeline right after extraction; suffix matching
    /// is left to the background passes.
    ///
    /// # Returns
    /// The chosen target, or `None` when the reference stays pending
    pub async fn bind_exact(&self, reference: &PendingReference) -> Result<Option<CodeEntity>> {
        if reference.target_qualified_name.starts_with("*.") {
            return Ok(None);
        }
        let exact = self
            .graph
            .find_entities_by_name(&reference.target_qualified_name)
            .await?;
        let Some(target) = select_candidate(reference, exact) else {
            return Ok(None);
        };
        self.bind(reference, &target).await?;
        Ok(Some(target))
    }

    /// Bind one reference if a target exists
    ///
    /// # Returns
    /// The chosen target, or `None` when nothing matched
    async fn resolve_one(&self, reference: &PendingReference) -> Result<Option<CodeEntity>> {
        let Some(target) = self.find_target(reference).await? else {
            return Ok(None);
        };
        self.bind(reference, &target).await?;
        Ok(Some(target))
    }

    /// Store the relation for `reference` and mark it resolved
    async fn bind(&self, reference: &PendingReference, target: &CodeEntity) -> Result<()> {
        let relation = CodeRelation::new(
            reference.source_entity_id.clone(),
            target.id.clone(),
            reference.kind,
            reference.source_repository_id.clone(),
        )
        .with_line(reference.line_number)
        .cross_repository(target.repository_id != reference.source_repository_id);
        self.graph.add_relation(&relation).await?;
        self.graph
            .resolve_pending_reference(&reference.id, &target.id)
            .await?;

        debug!(
            source = %reference.source_qualified_name,
            target = %target.qualified_name,
            kind = %reference.kind,
            cross_repository = relation.is_cross_repository,
            "Resolved reference"
        );
        Ok(())
    }

    /// Exact qualified-name match, then suffix match
    async fn find_target(&self, reference: &PendingReference) -> Result<Option<CodeEntity>> {
        let pattern = normalize_target(&reference.target_qualified_name);
        if pattern.is_empty() {
            return Ok(None);
        }

        if !reference.target_qualified_name.starts_with("*.") {
            let exact = self.graph.find_entities_by_name(pattern).await?;
            if let Some(target) = select_candidate(reference, exact) {
                return Ok(Some(target));
            }
        }

        // The backend matches the whole dotted pattern so the limit only
        // ever cuts genuine candidates
        let candidates = self
            .graph
            .find_entities_by_suffix(pattern, SUFFIX_CANDIDATE_LIMIT)
            .await?;
        if candidates.len() == SUFFIX_CANDIDATE_LIMIT {
            debug!(
                pattern = %pattern,
                limit = SUFFIX_CANDIDATE_LIMIT,
                "Suffix candidates truncated"
            );
        }
        Ok(select_candidate(reference, candidates))
    }

    async fn refresh_counts(&self, repository_id: &str) -> Result<()> {
        let relations = self.graph.count_relations(repository_id).await?;
        let pending = self.graph.count_pending_references(repository_id).await?;
        self.state
            .record_reference_counts(repository_id, relations, pending)
            .await
    }
}

fn log_resolution_error(reference: &PendingReference, error: &Error) {
    let error = Error::resolution(format!(
        "reference {} to '{}': {error}",
        reference.id, reference.target_qualified_name
    ));
    warn!(error = %error, "Reference left pending");
}
