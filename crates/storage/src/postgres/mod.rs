//! PostgreSQL backend for repository state, the file queue and the relation graph

mod graph;
mod rows;
mod state;

pub use graph::PostgresRelationGraph;
pub use state::PostgresStateStore;

use codeweave_core::{Error, Result, StorageConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Open a connection pool and apply pending migrations
pub async fn connect(config: &StorageConfig) -> Result<PgPool> {
    info!(
        host = %config.postgres_host,
        port = config.postgres_port,
        database = %config.postgres_database,
        "Connecting to PostgreSQL"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres_pool_size)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.postgres_url())
        .await
        .map_err(|e| Error::storage(format!("Failed to connect to PostgreSQL: {e}")))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to run migrations: {e}")))?;

    Ok(pool)
}
