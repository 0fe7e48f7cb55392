//! Library interface for the codeweave CLI
//!
//! Wiring and output formatting live here so integration tests can drive them
//! without spawning the binary.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod lock;
pub mod output;

use anyhow::{Context, Result};
use codeweave_core::Config;
use codeweave_indexer::Orchestrator;
use codeweave_languages::ExtractorRegistry;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load and validate the configuration
///
/// With `memory` the run is a dry run: in-process storage and mock embeddings,
/// nothing persisted.
pub fn load_config(path: Option<&Path>, memory: bool) -> Result<Config> {
    let mut config = Config::load(path).context("Failed to load configuration")?;
    if memory {
        config.storage.backend = "memory".to_string();
        config.embeddings.provider = "mock".to_string();
    }
    Ok(config)
}

/// Connect storage and embeddings and wire the orchestrator
pub async fn build_orchestrator(config: Config) -> Result<Orchestrator> {
    let embeddings = codeweave_embeddings::create_embedding_manager(&config.embeddings)
        .context("Failed to create embedding provider")?;
    let storage = codeweave_storage::create_storage(&config.storage, embeddings.dimension())
        .await
        .context("Failed to connect to storage")?;
    info!(
        backend = %config.storage.backend,
        repositories = config.repositories.len(),
        "Storage ready"
    );

    let orchestrator = Orchestrator::new(
        config,
        storage,
        Arc::new(ExtractorRegistry::with_defaults()),
        embeddings,
    )?;
    Ok(orchestrator)
}
