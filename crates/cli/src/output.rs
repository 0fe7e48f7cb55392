//! Plain-text rendering of query results

use codeweave_core::HealthStatus;
use codeweave_indexer::{References, RunReport, ScanReport, SearchHit, ServiceStatus};
use std::fmt::Write;

pub fn format_health(health: &HealthStatus) -> String {
    match health {
        HealthStatus::Healthy => "health: healthy\n".to_string(),
        HealthStatus::Degraded { loops } => format!("health: degraded ({})\n", loops.join(", ")),
    }
}

/// Health line, then one block per repository with failed files listed
/// alongside their last error
pub fn format_status(status: &ServiceStatus) -> String {
    let mut out = format_health(&status.health);
    for report in &status.repositories {
        let repo = &report.repository;
        let counts = &report.file_counts;
        let _ = writeln!(out, "{} [{}] {}", repo.name, repo.status, repo.root_path.display());
        let _ = writeln!(
            out,
            "  files: {} indexed, {} pending, {} indexing, {} failed",
            counts.indexed, counts.pending, counts.indexing, counts.failed
        );
        let _ = writeln!(
            out,
            "  graph: {} entities, {} relations, {} pending references",
            repo.stats.entity_count, repo.stats.relation_count, repo.stats.pending_reference_count
        );
        if let Some(error) = &repo.last_error {
            let _ = writeln!(out, "  error: {error}");
        }
        for file in report.files.iter().filter(|f| f.last_error.is_some()) {
            let _ = writeln!(
                out,
                "  ! {} ({} attempts): {}",
                file.path,
                file.attempts,
                file.last_error.as_deref().unwrap_or_default()
            );
        }
    }
    out
}

pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results\n".to_string();
    }
    let mut out = String::new();
    for (rank, hit) in hits.iter().enumerate() {
        let entity = &hit.entity;
        let _ = writeln!(
            out,
            "{:>2}. {:.3}  {} {} (line {})",
            rank + 1,
            hit.score,
            entity.kind,
            entity.qualified_name,
            entity.span.start_line
        );
        if let Some(signature) = &entity.signature {
            let _ = writeln!(out, "      {signature}");
        }
    }
    out
}

pub fn format_references(references: &References) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "incoming ({}):", references.incoming.len());
    for relation in &references.incoming {
        let _ = writeln!(out, "  {} <- {}", relation.kind, relation.source_id);
    }
    let _ = writeln!(out, "outgoing ({}):", references.outgoing.len());
    for relation in &references.outgoing {
        let marker = if relation.is_cross_repository { " (cross-repo)" } else { "" };
        let _ = writeln!(out, "  {} -> {}{marker}", relation.kind, relation.target_id);
    }
    out
}

pub fn format_scan(repository: &str, report: &ScanReport) -> String {
    format!(
        "{repository}: {} created, {} updated, {} deleted, {} unchanged, {} skipped\n",
        report.created, report.updated, report.deleted, report.unchanged, report.skipped
    )
}

pub fn format_run(report: &RunReport) -> String {
    let mut out: String = report
        .scans
        .iter()
        .map(|(name, scan)| format_scan(name, scan))
        .collect();
    let drain = &report.drain;
    let _ = writeln!(
        out,
        "indexed {}, re-embedded {}, deleted {}, failed {}",
        drain.indexed, drain.reembedded, drain.deleted, drain.failed
    );
    let _ = writeln!(
        out,
        "references: {} resolved, {} still pending, {} gave up",
        report.resolution.resolved, report.resolution.still_pending, report.resolution.failed
    );
    out
}
