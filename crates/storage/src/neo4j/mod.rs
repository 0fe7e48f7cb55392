//! Neo4j backend for the relation graph and entity vectors

mod graph;
mod vectors;

pub use graph::{Neo4jRelationGraph, ALLOWED_RELATIONSHIP_TYPES};
pub use vectors::Neo4jVectorStore;

use anyhow::Context;
use codeweave_core::{Error, StorageConfig};
use neo4rs::{ConfigBuilder, Graph, Query};
use std::sync::Arc;
use tracing::info;

/// Connect to Neo4j and create the lookup indexes the graph relies on
pub async fn connect(config: &StorageConfig) -> codeweave_core::Result<Arc<Graph>> {
    connect_inner(config).await.map_err(storage_error)
}

async fn connect_inner(config: &StorageConfig) -> anyhow::Result<Arc<Graph>> {
    info!(uri = %config.neo4j_uri, "Connecting to Neo4j");

    let mut builder = ConfigBuilder::default()
        .uri(config.neo4j_uri.as_str())
        .user(config.neo4j_user.as_str())
        .password(config.neo4j_password.as_str());
    if let Some(database) = &config.neo4j_database {
        builder = builder.db(database.as_str());
    }
    let neo4j_config = builder.build().context("Invalid Neo4j configuration")?;
    let graph = Graph::connect(neo4j_config)
        .await
        .context("Failed to connect to Neo4j")?;

    for statement in [
        "CREATE INDEX entity_id IF NOT EXISTS FOR (e:Entity) ON (e.id)",
        "CREATE INDEX entity_file IF NOT EXISTS FOR (e:Entity) ON (e.file_id)",
        "CREATE INDEX entity_qualified_name IF NOT EXISTS FOR (e:Entity) ON (e.qualified_name)",
        "CREATE INDEX entity_repository IF NOT EXISTS FOR (e:Entity) ON (e.repository_id)",
        "CREATE INDEX pending_reference_id IF NOT EXISTS FOR (p:PendingReference) ON (p.id)",
        "CREATE INDEX pending_reference_status IF NOT EXISTS FOR (p:PendingReference) ON (p.status)",
        "CREATE INDEX pending_reference_source IF NOT EXISTS FOR (p:PendingReference) ON (p.source_entity_id)",
        "CREATE INDEX entity_vector_id IF NOT EXISTS FOR (v:EntityVector) ON (v.entity_id)",
        "CREATE INDEX entity_vector_file IF NOT EXISTS FOR (v:EntityVector) ON (v.file_id)",
    ] {
        graph
            .run(Query::new(statement.to_string()))
            .await
            .with_context(|| format!("Failed to create index: {statement}"))?;
    }

    Ok(Arc::new(graph))
}

pub(crate) fn storage_error(err: anyhow::Error) -> Error {
    Error::storage(format!("{err:#}"))
}
