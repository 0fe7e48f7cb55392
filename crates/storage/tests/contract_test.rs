//! One call sequence, every backend: the in-memory backend always runs, the
//! live Postgres/Qdrant/Neo4j runs are ignored unless services are available

mod common;

use anyhow::Result;
use chrono::Utc;
use codeweave_core::{
    ChangeKind, CodeRelation, EntityKind, FileStatus, FileTask, PendingReference,
    ReferenceStatus, RelationKind, SearchFilters, StorageConfig, UnresolvedReference,
};
use codeweave_storage::{create_storage, StorageHandles};
use common::*;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::time::Duration;

const DIMENSION: usize = 4;
const TIMEOUT: Duration = Duration::from_secs(60);

async fn file_lifecycle(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;
    let file = create_file(handles, &repository, "pkg/a.py").await?;
    assert_eq!(file.status, FileStatus::Pending);

    assert!(handles.state.claim_file(&file.id).await?);
    assert!(!handles.state.claim_file(&file.id).await?);

    handles
        .state
        .complete_file(&file.id, Some("abc"), 64)
        .await?;
    let stored = handles.state.get_file(&file.id).await?.expect("file exists");
    assert_eq!(stored.status, FileStatus::Indexed);
    assert_eq!(stored.checksum.as_deref(), Some("abc"));
    assert!(stored.last_indexed_at.is_some());

    let failed = handles.state.fail_file(&file.id, None, "boom").await?;
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.checksum.as_deref(), Some("abc"));
    let failed = handles
        .state
        .fail_file(&file.id, Some("def"), "boom again")
        .await?;
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.checksum.as_deref(), Some("def"));
    assert_eq!(failed.last_error.as_deref(), Some("boom again"));

    let due = Utc::now() - chrono::Duration::seconds(1);
    handles.state.schedule_retry(&file.id, Some(due)).await?;
    let retryable = handles.state.retryable_files(Utc::now(), 100).await?;
    assert!(retryable.iter().any(|f| f.id == file.id));

    assert_eq!(handles.state.reset_failed(&repository.id).await?, 1);
    let reset = handles.state.get_file(&file.id).await?.expect("file exists");
    assert_eq!(reset.status, FileStatus::Pending);
    assert_eq!(reset.attempts, 0);

    handles.state.tombstone_file(&file.id).await?;
    let counts = handles.state.count_files_by_status(&repository.id).await?;
    assert_eq!(counts.deleted, 1);
    assert_eq!(counts.live(), 0);

    // A recreated file comes back as pending under the same id
    let recreated = create_file(handles, &repository, "pkg/a.py").await?;
    assert_eq!(recreated.id, file.id);
    assert_eq!(recreated.status, FileStatus::Pending);
    Ok(())
}

async fn upsert_leaves_claimed_file_alone(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;
    let file = create_file(handles, &repository, "busy.py").await?;
    assert!(handles.state.claim_file(&file.id).await?);

    let again = create_file(handles, &repository, "busy.py").await?;
    assert_eq!(again.status, FileStatus::Indexing);

    let recovered = handles
        .state
        .recover_stale_claims(Utc::now() + chrono::Duration::seconds(5))
        .await?;
    assert!(recovered >= 1);
    let file = handles.state.get_file(&file.id).await?.expect("file exists");
    assert_eq!(file.status, FileStatus::Pending);
    Ok(())
}

async fn queue_semantics(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;
    let file = create_file(handles, &repository, "q.py").await?;
    let task = FileTask::new(&repository.id, "q.py", ChangeKind::Create);
    let before = handles.state.queue_len().await?;

    assert!(handles.state.enqueue(&task).await?);
    let update = FileTask::new(&repository.id, "q.py", ChangeKind::Update);
    assert!(!handles.state.enqueue(&update).await?);
    assert_eq!(handles.state.queue_len().await?, before + 1);

    let queued = loop {
        let next = handles.state.dequeue_next().await?.expect("task available");
        if next.task.file_id == file.id {
            break next;
        }
        handles.state.mark_done(&next.queue_id).await?;
    };
    assert_eq!(queued.task.change, ChangeKind::Update);

    // The in-flight entry hides its file from other dequeuers
    handles.state.enqueue(&task).await?;
    let other = handles.state.dequeue_next().await?;
    assert!(other.is_none_or(|t| t.task.file_id != file.id));

    // Requeueing drops the stale entry because a newer one waits
    handles.state.requeue(&queued.queue_id, Duration::ZERO).await?;
    let next = handles.state.dequeue_next().await?.expect("task available");
    assert_eq!(next.task.file_id, file.id);
    handles.state.mark_done(&next.queue_id).await?;
    assert!(handles.state.dequeue_next().await?.is_none());

    // Pending files without an entry are re-enqueued on recovery
    assert!(handles.state.requeue_orphans().await? >= 1);
    let mut orphan = None;
    while let Some(next) = handles.state.dequeue_next().await? {
        if next.task.file_id == file.id {
            orphan = Some(next);
        } else {
            handles.state.mark_done(&next.queue_id).await?;
        }
    }
    let orphan = orphan.expect("orphan enqueued");
    assert_eq!(orphan.task.change, ChangeKind::Create);

    let released = handles
        .state
        .recover_stale_dequeues(Utc::now() + chrono::Duration::seconds(5))
        .await?;
    assert_eq!(released, 1);
    let again = handles.state.dequeue_next().await?.expect("released task");
    assert_eq!(again.queue_id, orphan.queue_id);
    handles.state.mark_done(&again.queue_id).await?;
    Ok(())
}

async fn deletion_cascade(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;
    let file_a = create_file(handles, &repository, "a.py").await?;
    let file_b = create_file(handles, &repository, "b.py").await?;

    let foo = entity(&file_a, "a.foo", EntityKind::Function, 1);
    let main = entity(&file_b, "b.main", EntityKind::Function, 3);
    let helper = entity(&file_b, "b.helper", EntityKind::Function, 8);
    handles.graph.add_entities(&[foo.clone()]).await?;
    handles
        .graph
        .add_entities(&[main.clone(), helper.clone()])
        .await?;

    let calls = CodeRelation::new(&main.id, &foo.id, RelationKind::Calls, &repository.id);
    let first_id = handles.graph.add_relation(&calls).await?;
    let duplicate = CodeRelation::new(&main.id, &foo.id, RelationKind::Calls, &repository.id);
    assert_eq!(handles.graph.add_relation(&duplicate).await?, first_id);
    handles
        .graph
        .add_relation(&CodeRelation::new(
            &helper.id,
            &main.id,
            RelationKind::Calls,
            &repository.id,
        ))
        .await?;

    let reference = PendingReference::from_unresolved(
        &UnresolvedReference {
            source_entity_id: main.id.clone(),
            source_qualified_name: main.qualified_name.clone(),
            target_qualified_name: "a.foo".to_string(),
            kind: RelationKind::Calls,
            line_number: Some(4),
            receiver_expr: None,
        },
        &repository.id,
    );
    handles.graph.add_pending_reference(&reference).await?;
    handles
        .graph
        .resolve_pending_reference(&reference.id, &foo.id)
        .await?;
    assert_eq!(handles.graph.count_pending_references(&repository.id).await?, 0);

    assert_eq!(handles.graph.delete_entities_for_file(&file_a.id).await?, 1);
    assert!(handles.graph.get_entity(&foo.id).await?.is_none());
    assert!(handles.graph.relations_to(&foo.id).await?.is_empty());
    assert_eq!(handles.graph.relations_from(&main.id).await?.len(), 0);
    assert_eq!(handles.graph.relations_to(&main.id).await?.len(), 1);

    let reverted = handles
        .graph
        .get_pending_reference(&reference.id)
        .await?
        .expect("reference kept");
    assert_eq!(reverted.status, ReferenceStatus::Pending);
    assert_eq!(reverted.attempts, 0);
    assert!(reverted.resolved_target_id.is_none());
    assert_eq!(handles.graph.count_pending_references(&repository.id).await?, 1);

    // Deleting the source file takes its references with it
    let replacement = entity(&file_b, "b.main", EntityKind::Function, 3);
    assert_eq!(
        handles
            .graph
            .replace_file_entities(&file_b.id, &[replacement.clone()])
            .await?,
        2
    );
    assert!(handles.graph.get_pending_reference(&reference.id).await?.is_none());
    assert_eq!(handles.graph.count_entities(&repository.id).await?, 1);
    assert_eq!(handles.graph.count_relations(&repository.id).await?, 0);
    let listed = handles.graph.entities_for_file(&file_b.id).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, replacement.id);
    Ok(())
}

async fn name_lookups(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;
    let file = create_file(handles, &repository, "lookup.py").await?;
    let marker = uuid::Uuid::new_v4().simple().to_string();
    let names = [
        format!("z{marker}.util.parse"),
        format!("a{marker}.util.parse"),
        format!("a{marker}.reparse"),
    ];
    let entities: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| entity(&file, name, EntityKind::Function, i + 1))
        .collect();
    handles.graph.add_entities(&entities).await?;

    let exact = handles.graph.find_entities_by_name(&names[0]).await?;
    assert_eq!(exact.len(), 1);

    let suffix = handles
        .graph
        .find_entities_by_suffix(&format!("{marker}.util.parse"), 10)
        .await?;
    assert_eq!(suffix.len(), 0);

    let by_suffix = handles.graph.find_entities_by_suffix("util.parse", 1000).await?;
    let ours: Vec<String> = by_suffix
        .iter()
        .filter(|e| e.qualified_name.contains(&marker))
        .map(|e| e.qualified_name.clone())
        .collect();
    assert_eq!(ours, vec![names[1].clone(), names[0].clone()]);

    handles.graph.set_vector_id(&entities[0].id, "v-1").await?;
    let stored = handles
        .graph
        .get_entity(&entities[0].id)
        .await?
        .expect("entity exists");
    assert_eq!(stored.vector_id.as_deref(), Some("v-1"));
    Ok(())
}

async fn reference_claims(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;
    let file = create_file(handles, &repository, "refs.py").await?;
    let source = entity(&file, "refs.run", EntityKind::Function, 1);
    handles.graph.add_entities(&[source.clone()]).await?;

    let reference = PendingReference::from_unresolved(
        &UnresolvedReference {
            source_entity_id: source.id.clone(),
            source_qualified_name: source.qualified_name.clone(),
            target_qualified_name: "missing.target".to_string(),
            kind: RelationKind::Calls,
            line_number: None,
            receiver_expr: None,
        },
        &repository.id,
    );
    handles.graph.add_pending_reference(&reference).await?;

    let lease = Duration::from_secs(60);
    let claimed = handles.graph.claim_pending_references(10_000, lease).await?;
    assert!(claimed.iter().any(|r| r.id == reference.id));
    let second = handles.graph.claim_pending_references(10_000, lease).await?;
    assert!(second.iter().all(|r| r.id != reference.id));

    for expected in [ReferenceStatus::Pending, ReferenceStatus::Pending] {
        assert_eq!(
            handles.graph.record_failed_attempt(&reference.id, 3).await?,
            expected
        );
    }
    assert_eq!(
        handles.graph.record_failed_attempt(&reference.id, 3).await?,
        ReferenceStatus::Failed
    );
    let failed = handles
        .graph
        .get_pending_reference(&reference.id)
        .await?
        .expect("reference kept");
    assert_eq!(failed.attempts, 3);
    assert_eq!(handles.graph.count_pending_references(&repository.id).await?, 0);
    Ok(())
}

async fn vector_search(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;
    let file_a = create_file(handles, &repository, "va.py").await?;
    let file_b = create_file(handles, &repository, "vb.py").await?;
    let near = entity(&file_a, "va.near", EntityKind::Function, 1);
    let far = entity(&file_a, "va.far", EntityKind::Class, 5);
    let other = entity(&file_b, "vb.other", EntityKind::Function, 1);
    handles
        .graph
        .add_entities(&[near.clone(), far.clone(), other.clone()])
        .await?;

    let ids = handles
        .vectors
        .add_vectors(&[
            vector_record(&near, &file_a, vec![1.0, 0.0, 0.0, 0.0]),
            vector_record(&far, &file_a, vec![0.0, 1.0, 0.0, 0.0]),
            vector_record(&other, &file_b, vec![0.9, 0.1, 0.0, 0.0]),
        ])
        .await?;
    assert_eq!(ids.len(), 3);

    let filters = SearchFilters {
        repository_id: Some(repository.id.clone()),
        ..Default::default()
    };
    let hits = handles
        .vectors
        .search(&[1.0, 0.0, 0.0, 0.0], 2, &filters)
        .await?;
    let hit_ids: Vec<&str> = hits.iter().map(|h| h.entity_id.as_str()).collect();
    assert_eq!(hit_ids, vec![near.id.as_str(), other.id.as_str()]);
    assert!((hits[0].score - 1.0).abs() < 1e-3);

    let classes = SearchFilters {
        repository_id: Some(repository.id.clone()),
        kind: Some(EntityKind::Class),
        ..Default::default()
    };
    let hits = handles
        .vectors
        .search(&[1.0, 0.0, 0.0, 0.0], 10, &classes)
        .await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity_id, far.id);

    assert_eq!(handles.vectors.delete_vectors_for_file(&file_a.id).await?, 2);
    let hits = handles
        .vectors
        .search(&[1.0, 0.0, 0.0, 0.0], 10, &filters)
        .await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity_id, other.id);

    let wrong = vector_record(&other, &file_b, vec![1.0, 0.0]);
    assert!(handles.vectors.add_vectors(&[wrong]).await.is_err());
    Ok(())
}

async fn concurrent_claims(handles: &StorageHandles) -> Result<()> {
    let repository = create_repository(handles).await?;

    let file = create_file(handles, &repository, "race.py").await?;
    let claimers: Vec<_> = (0..8)
        .map(|_| {
            let state = handles.state.clone();
            let id = file.id.clone();
            tokio::spawn(async move { state.claim_file(&id).await })
        })
        .collect();
    let mut won = 0;
    for claimer in claimers {
        if claimer.await?? {
            won += 1;
        }
    }
    assert_eq!(won, 1);

    let mut queued_files = HashSet::new();
    for i in 0..6 {
        let file = create_file(handles, &repository, &format!("race_{i}.py")).await?;
        let task = FileTask::new(&repository.id, &file.path, ChangeKind::Create);
        assert!(handles.state.enqueue(&task).await?);
        queued_files.insert(file.id);
    }
    let dequeuers: Vec<_> = (0..4)
        .map(|_| {
            let state = handles.state.clone();
            tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(next) = state.dequeue_next().await? {
                    taken.push(next);
                }
                codeweave_core::Result::Ok(taken)
            })
        })
        .collect();
    let mut taken = Vec::new();
    for dequeuer in dequeuers {
        taken.extend(dequeuer.await??);
    }
    let queue_ids: HashSet<&str> = taken.iter().map(|t| t.queue_id.as_str()).collect();
    assert_eq!(queue_ids.len(), taken.len());
    let ours: Vec<&str> = taken
        .iter()
        .map(|t| t.task.file_id.as_str())
        .filter(|id| queued_files.contains(*id))
        .collect();
    assert_eq!(ours.len(), queued_files.len());
    for next in &taken {
        handles.state.mark_done(&next.queue_id).await?;
    }

    let source_file = create_file(handles, &repository, "race_refs.py").await?;
    let source = entity(&source_file, "race_refs.run", EntityKind::Function, 1);
    handles.graph.add_entities(&[source.clone()]).await?;
    let mut references = HashSet::new();
    for i in 0..20 {
        let reference = PendingReference::from_unresolved(
            &UnresolvedReference {
                source_entity_id: source.id.clone(),
                source_qualified_name: source.qualified_name.clone(),
                target_qualified_name: format!("missing.target_{i}"),
                kind: RelationKind::Calls,
                line_number: Some(i + 1),
                receiver_expr: None,
            },
            &repository.id,
        );
        handles.graph.add_pending_reference(&reference).await?;
        references.insert(reference.id);
    }
    let resolvers: Vec<_> = (0..4)
        .map(|_| {
            let graph = handles.graph.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let batch = graph
                        .claim_pending_references(5, Duration::from_secs(60))
                        .await?;
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|r| r.id));
                }
                codeweave_core::Result::Ok(claimed)
            })
        })
        .collect();
    let mut claimed = Vec::new();
    for resolver in resolvers {
        claimed.extend(resolver.await??);
    }
    let distinct: HashSet<&String> = claimed.iter().collect();
    assert_eq!(distinct.len(), claimed.len());
    assert!(references.iter().all(|id| distinct.contains(id)));
    Ok(())
}

async fn run_contract(handles: StorageHandles) -> Result<()> {
    with_timeout(TIMEOUT, async {
        file_lifecycle(&handles).await?;
        upsert_leaves_claimed_file_alone(&handles).await?;
        queue_semantics(&handles).await?;
        deletion_cascade(&handles).await?;
        name_lookups(&handles).await?;
        reference_claims(&handles).await?;
        vector_search(&handles).await?;
        concurrent_claims(&handles).await?;
        handles.close().await;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_backend_contract() -> Result<()> {
    let handles = create_storage(&StorageConfig::memory(), DIMENSION).await?;
    run_contract(handles).await
}

#[tokio::test]
#[ignore = "requires PostgreSQL and Qdrant on localhost"]
async fn test_postgres_backend_contract() -> Result<()> {
    let config = StorageConfig {
        backend: "postgres".to_string(),
        collection_name: format!("contract_{}", uuid::Uuid::new_v4().simple()),
        ..StorageConfig::default()
    };
    let handles = create_storage(&config, DIMENSION).await?;
    run_contract(handles).await
}

#[tokio::test]
#[ignore = "requires PostgreSQL and Neo4j on localhost"]
async fn test_neo4j_backend_contract() -> Result<()> {
    let config = StorageConfig {
        backend: "neo4j".to_string(),
        ..StorageConfig::default()
    };
    let handles = create_storage(&config, DIMENSION).await?;
    run_contract(handles).await
}
