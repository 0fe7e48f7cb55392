use crate::{after, matches_suffix, RelationGraph};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codeweave_core::{
    CodeEntity, CodeRelation, Error, PendingReference, ReferenceStatus, Result,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct PendingEntry {
    reference: PendingReference,
    claimed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct GraphData {
    entities: HashMap<String, CodeEntity>,
    relations: HashMap<String, CodeRelation>,
    references: HashMap<String, PendingEntry>,
}

impl GraphData {
    fn reference_mut(&mut self, id: &str) -> Result<&mut PendingEntry> {
        self.references
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("pending reference {id}")))
    }
}

/// Relation graph kept in process memory
#[derive(Debug, Default)]
pub struct MemoryRelationGraph {
    data: RwLock<GraphData>,
}

impl MemoryRelationGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelationGraph for MemoryRelationGraph {
    async fn add_entities(&self, entities: &[CodeEntity]) -> Result<Vec<String>> {
        let mut data = self.data.write().await;
        let ids = entities
            .iter()
            .map(|entity| {
                data.entities.insert(entity.id.clone(), entity.clone());
                entity.id.clone()
            })
            .collect();
        Ok(ids)
    }

    async fn get_entity(&self, id: &str) -> Result<Option<CodeEntity>> {
        Ok(self.data.read().await.entities.get(id).cloned())
    }

    async fn find_entities_by_name(&self, qualified_name: &str) -> Result<Vec<CodeEntity>> {
        let data = self.data.read().await;
        let mut found: Vec<CodeEntity> = data
            .entities
            .values()
            .filter(|e| e.qualified_name == qualified_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn find_entities_by_suffix(
        &self,
        suffix: &str,
        limit: usize,
    ) -> Result<Vec<CodeEntity>> {
        let data = self.data.read().await;
        let mut found: Vec<CodeEntity> = data
            .entities
            .values()
            .filter(|e| matches_suffix(&e.qualified_name, suffix))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.qualified_name
                .cmp(&b.qualified_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn entities_for_file(&self, file_id: &str) -> Result<Vec<CodeEntity>> {
        let data = self.data.read().await;
        let mut found: Vec<CodeEntity> = data
            .entities
            .values()
            .filter(|e| e.file_id == file_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.span
                .start_line
                .cmp(&b.span.start_line)
                .then_with(|| a.qualified_name.cmp(&b.qualified_name))
        });
        Ok(found)
    }

    async fn delete_entities_for_file(&self, file_id: &str) -> Result<u64> {
        let mut data = self.data.write().await;
        let doomed: HashSet<String> = data
            .entities
            .values()
            .filter(|e| e.file_id == file_id)
            .map(|e| e.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        data.entities.retain(|id, _| !doomed.contains(id));
        data.relations
            .retain(|_, r| !doomed.contains(&r.source_id) && !doomed.contains(&r.target_id));
        data.references
            .retain(|_, p| !doomed.contains(&p.reference.source_entity_id));
        for entry in data.references.values_mut() {
            let reference = &mut entry.reference;
            let lost_target = reference
                .resolved_target_id
                .as_ref()
                .is_some_and(|target| doomed.contains(target));
            if reference.status == ReferenceStatus::Resolved && lost_target {
                reference.status = ReferenceStatus::Pending;
                reference.attempts = 0;
                reference.resolved_target_id = None;
                entry.claimed_until = None;
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn set_vector_id(&self, entity_id: &str, vector_id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        let entity = data
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| Error::not_found(format!("entity {entity_id}")))?;
        entity.vector_id = Some(vector_id.to_string());
        Ok(())
    }

    async fn add_relation(&self, relation: &CodeRelation) -> Result<String> {
        let mut data = self.data.write().await;
        if let Some(existing) = data.relations.values().find(|r| {
            r.source_id == relation.source_id
                && r.target_id == relation.target_id
                && r.kind == relation.kind
        }) {
            return Ok(existing.id.clone());
        }
        data.relations.insert(relation.id.clone(), relation.clone());
        Ok(relation.id.clone())
    }

    async fn relations_from(&self, entity_id: &str) -> Result<Vec<CodeRelation>> {
        let data = self.data.read().await;
        let mut found: Vec<CodeRelation> = data
            .relations
            .values()
            .filter(|r| r.source_id == entity_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.kind
                .to_string()
                .cmp(&b.kind.to_string())
                .then_with(|| a.target_id.cmp(&b.target_id))
        });
        Ok(found)
    }

    async fn relations_to(&self, entity_id: &str) -> Result<Vec<CodeRelation>> {
        let data = self.data.read().await;
        let mut found: Vec<CodeRelation> = data
            .relations
            .values()
            .filter(|r| r.target_id == entity_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.kind
                .to_string()
                .cmp(&b.kind.to_string())
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        Ok(found)
    }

    async fn add_pending_reference(&self, reference: &PendingReference) -> Result<String> {
        let mut data = self.data.write().await;
        data.references.insert(
            reference.id.clone(),
            PendingEntry {
                reference: reference.clone(),
                claimed_until: None,
            },
        );
        Ok(reference.id.clone())
    }

    async fn get_pending_reference(&self, id: &str) -> Result<Option<PendingReference>> {
        let data = self.data.read().await;
        Ok(data.references.get(id).map(|e| e.reference.clone()))
    }

    async fn claim_pending_references(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PendingReference>> {
        let mut data = self.data.write().await;
        let now = Utc::now();
        let mut available: Vec<&mut PendingEntry> = data
            .references
            .values_mut()
            .filter(|e| {
                e.reference.status == ReferenceStatus::Pending
                    && e.claimed_until.is_none_or(|until| until <= now)
            })
            .collect();
        available.sort_by(|a, b| {
            a.reference
                .created_at
                .cmp(&b.reference.created_at)
                .then_with(|| a.reference.id.cmp(&b.reference.id))
        });

        let until = after(now, lease);
        Ok(available
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.claimed_until = Some(until);
                entry.reference.clone()
            })
            .collect())
    }

    async fn resolve_pending_reference(&self, id: &str, target_id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        let entry = data.reference_mut(id)?;
        entry.reference.status = ReferenceStatus::Resolved;
        entry.reference.resolved_target_id = Some(target_id.to_string());
        entry.claimed_until = None;
        Ok(())
    }

    async fn record_failed_attempt(&self, id: &str, max_attempts: u32) -> Result<ReferenceStatus> {
        let mut data = self.data.write().await;
        let entry = data.reference_mut(id)?;
        entry.reference.attempts += 1;
        if entry.reference.attempts >= max_attempts {
            entry.reference.status = ReferenceStatus::Failed;
        }
        entry.claimed_until = None;
        Ok(entry.reference.status)
    }

    async fn count_entities(&self, repository_id: &str) -> Result<u64> {
        let data = self.data.read().await;
        Ok(data
            .entities
            .values()
            .filter(|e| e.repository_id == repository_id)
            .count() as u64)
    }

    async fn count_relations(&self, repository_id: &str) -> Result<u64> {
        let data = self.data.read().await;
        Ok(data
            .relations
            .values()
            .filter(|r| r.repository_id == repository_id)
            .count() as u64)
    }

    async fn count_pending_references(&self, repository_id: &str) -> Result<u64> {
        let data = self.data.read().await;
        Ok(data
            .references
            .values()
            .filter(|e| {
                e.reference.source_repository_id == repository_id
                    && e.reference.status == ReferenceStatus::Pending
            })
            .count() as u64)
    }
}
