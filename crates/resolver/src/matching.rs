//! Candidate selection for pending references
//!
//! Pure functions: the resolver fetches candidates from the relation graph
//! and these decide which one, if any, a reference binds to.

use codeweave_core::{CodeEntity, PendingReference};
use tracing::debug;

/// Target name with a leading `*.` wildcard removed
pub fn normalize_target(target: &str) -> &str {
    target.strip_prefix("*.").unwrap_or(target)
}

/// `chart_writer` -> `ChartWriter`, using the last segment of dotted receivers
pub fn receiver_type_hint(receiver_expr: &str) -> String {
    let last = receiver_expr.rsplit('.').next().unwrap_or(receiver_expr);
    last.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Whether the receiver of a call plausibly names the candidate's type
pub fn matches_receiver(qualified_name: &str, receiver_expr: &str) -> bool {
    let hint = receiver_type_hint(receiver_expr).to_lowercase();
    !hint.is_empty() && qualified_name.to_lowercase().contains(&hint)
}

/// Pick the entity `reference` should bind to
///
/// Narrowing steps, each applied only when it leaves at least one
/// candidate:
/// 1. the receiver hint, which leaves the reference unbound when no
///    candidate matches it
/// 2. entity kinds preferred for the relation kind
/// 3. the source's repository
///
/// The survivor with the lexicographically smallest qualified name wins.
pub fn select_candidate(
    reference: &PendingReference,
    candidates: Vec<CodeEntity>,
) -> Option<CodeEntity> {
    let mut working: Vec<CodeEntity> = candidates
        .into_iter()
        .filter(|c| c.id != reference.source_entity_id)
        .collect();
    if working.len() <= 1 {
        return working.pop();
    }

    if let Some(receiver) = reference.receiver_expr.as_deref() {
        let matched: Vec<CodeEntity> = working
            .iter()
            .filter(|c| matches_receiver(&c.qualified_name, receiver))
            .cloned()
            .collect();
        if matched.is_empty() {
            debug!(
                target = %reference.target_qualified_name,
                receiver,
                candidates = working.len(),
                "No candidate matches receiver, leaving reference unbound"
            );
            return None;
        }
        working = matched;
    }

    let preferred = reference.kind.preferred_target_kinds();
    if !preferred.is_empty() {
        narrow(&mut working, |c| preferred.contains(&c.kind));
    }

    narrow(&mut working, |c| {
        c.repository_id == reference.source_repository_id
    });

    working.into_iter().min_by(|a, b| {
        a.qualified_name
            .cmp(&b.qualified_name)
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Keep the candidates satisfying `keep`, unless none does
fn narrow(working: &mut Vec<CodeEntity>, keep: impl Fn(&CodeEntity) -> bool) {
    if working.iter().any(&keep) {
        working.retain(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::{
        CodeEntityBuilder, EntityKind, Language, RelationKind, UnresolvedReference,
    };
    use pretty_assertions::assert_eq;

    fn entity(repository: &str, qualified_name: &str, kind: EntityKind) -> CodeEntity {
        CodeEntityBuilder::default()
            .repository_id(repository)
            .qualified_name(qualified_name)
            .simple_name(qualified_name.rsplit('.').next().unwrap())
            .kind(kind)
            .language(Language::Python)
            .build()
            .unwrap()
    }

    fn reference(target: &str, kind: RelationKind, receiver: Option<&str>) -> PendingReference {
        let unresolved = UnresolvedReference {
            source_entity_id: "source".to_string(),
            source_qualified_name: "app.main".to_string(),
            target_qualified_name: target.to_string(),
            kind,
            line_number: Some(3),
            receiver_expr: receiver.map(str::to_string),
        };
        PendingReference::from_unresolved(&unresolved, "repo-a")
    }

    fn chosen(reference: &PendingReference, candidates: Vec<CodeEntity>) -> Option<String> {
        select_candidate(reference, candidates).map(|c| c.qualified_name)
    }

    #[test]
    fn test_target_helpers() {
        assert_eq!(normalize_target("*.Validator"), "Validator");
        assert_eq!(receiver_type_hint("chart_writer"), "ChartWriter");
        assert_eq!(receiver_type_hint("ctx.redis"), "Redis");
    }

    #[test]
    fn test_receiver_hint_picks_matching_class() {
        let r = reference("get", RelationKind::Calls, Some("chart_writer"));
        let candidates = vec![
            entity("repo-a", "app.cache.Cache.get", EntityKind::Method),
            entity("repo-b", "charts.ChartWriter.get", EntityKind::Method),
        ];
        assert_eq!(chosen(&r, candidates), Some("charts.ChartWriter.get".to_string()));
    }

    #[test]
    fn test_receiver_mismatch_leaves_reference_unbound() {
        let r = reference("get", RelationKind::Calls, Some("session"));
        let candidates = vec![
            entity("repo-a", "app.cache.Cache.get", EntityKind::Method),
            entity("repo-a", "app.store.Store.get", EntityKind::Method),
        ];
        assert_eq!(chosen(&r, candidates), None);
    }

    #[test]
    fn test_preferred_kind_beats_repository() {
        let r = reference("Validator", RelationKind::Extends, None);
        let candidates = vec![
            entity("repo-a", "app.checks.Validator", EntityKind::Function),
            entity("repo-b", "sdk.Validator", EntityKind::Class),
        ];
        assert_eq!(chosen(&r, candidates), Some("sdk.Validator".to_string()));
    }

    #[test]
    fn test_same_repository_then_lexicographic() {
        let r = reference("parse", RelationKind::Calls, None);
        let candidates = vec![
            entity("repo-b", "aaa.parse", EntityKind::Function),
            entity("repo-a", "zzz.parse", EntityKind::Function),
            entity("repo-a", "mmm.parse", EntityKind::Function),
        ];
        assert_eq!(chosen(&r, candidates), Some("mmm.parse".to_string()));
    }

    #[test]
    fn test_single_candidate_wins_without_heuristics() {
        let r = reference("get", RelationKind::Calls, Some("session"));
        let candidates = vec![entity("repo-b", "app.cache.Cache.get", EntityKind::Method)];
        assert_eq!(chosen(&r, candidates), Some("app.cache.Cache.get".to_string()));
    }
}
