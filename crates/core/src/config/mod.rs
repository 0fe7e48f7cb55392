//! Configuration module for codeweave
//!
//! Configuration is loaded from a TOML file and overridden by environment
//! variables. Every section has defaults, so an empty file is a valid
//! configuration for the in-memory backend.

mod defaults;
mod loading;

#[cfg(test)]
mod tests;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use defaults::*;

/// Returns the path to the global configuration file
///
/// The global config is stored at `~/.codeweave/config.toml`.
pub fn global_config_path() -> Result<PathBuf> {
    let home_dir = dirs::home_dir()
        .ok_or_else(|| Error::config("Unable to determine home directory".to_string()))?;
    Ok(home_dir.join(".codeweave").join("config.toml"))
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Repositories to index
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    /// File selection rules shared by all repositories
    #[serde(default)]
    pub files: FilesConfig,

    /// Indexing pipeline and orchestrator settings
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Reference resolver settings
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Embedding provider settings
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    /// Storage backend settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// File watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,
}

/// One repository to index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Unique repository name
    pub name: String,

    /// Root of the working tree
    pub path: PathBuf,

    /// Branch expected to be checked out
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Names of repositories this one references
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Which files are indexed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Glob patterns (relative to the repository root) a file must match
    #[serde(default = "default_include_patterns")]
    pub include: Vec<String>,

    /// Glob patterns that exclude a file even when included
    #[serde(default = "default_exclude_patterns")]
    pub exclude: Vec<String>,

    /// Honour `.gitignore` files while walking
    #[serde(default = "default_respect_gitignore")]
    pub respect_gitignore: bool,

    /// Files larger than this are skipped
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            include: default_include_patterns(),
            exclude: default_exclude_patterns(),
            respect_gitignore: default_respect_gitignore(),
            max_file_size_kb: default_max_file_size_kb(),
        }
    }
}

impl FilesConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_kb * 1024
    }
}

/// Indexing pipeline and orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Maximum files indexed concurrently
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Attempts before a failing file is given up on
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff for the first retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on the retry backoff
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// How often the retry loop looks for failed files
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Claims older than this are considered abandoned by a crashed worker
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,

    /// Consecutive storage failures a loop tolerates before reporting degraded
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// How long shutdown waits for in-flight files
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Backlog poll interval when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Start file watchers after the initial scan
    #[serde(default = "default_watch")]
    pub watch: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            stale_claim_secs: default_stale_claim_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            watch: default_watch(),
        }
    }
}

impl IndexingConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Reference resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Seconds between resolver passes
    #[serde(default = "default_resolution_interval_secs")]
    pub interval_secs: u64,

    /// Pending references handled per batch
    #[serde(default = "default_resolution_batch_size")]
    pub batch_size: usize,

    /// Passes after which an unmatched reference is marked failed
    #[serde(default = "default_resolution_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_resolution_interval_secs(),
            batch_size: default_resolution_batch_size(),
            max_attempts: default_resolution_max_attempts(),
        }
    }
}

impl ResolutionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration for embeddings generation
///
/// # Providers
/// - `openai_compatible` (default): any server exposing `POST {api_base_url}/embeddings`
/// - `mock`: deterministic local vectors for testing
#[derive(Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    /// Provider type: "openai_compatible" or "mock"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API base URL
    #[serde(default = "default_api_base_url")]
    pub api_base_url: Option<String>,

    /// API key (or use the EMBEDDING_API_KEY env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension size
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Texts sent per request
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Request timeout
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for failed requests
    #[serde(default = "default_embedding_retry_attempts")]
    pub retry_attempts: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_base_url: default_api_base_url(),
            api_key: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout_secs(),
            retry_attempts: default_embedding_retry_attempts(),
        }
    }
}

impl std::fmt::Debug for EmbeddingsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingsConfig")
            .field("provider", &self.provider)
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***REDACTED***"))
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("batch_size", &self.batch_size)
            .field("timeout_secs", &self.timeout_secs)
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

/// Configuration for the storage backend
///
/// # Backends
/// - `postgres` (default): Postgres state and relation graph, Qdrant vectors
/// - `neo4j`: Postgres state, Neo4j relation graph and vectors
/// - `memory`: in-process, nothing persisted
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selector
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Postgres host address
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    /// Postgres port
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    /// Postgres database name
    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    /// Postgres username
    #[serde(default = "default_postgres_user")]
    pub postgres_user: String,

    /// Postgres password
    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    /// Postgres connection pool size (max connections)
    #[serde(default = "default_postgres_pool_size")]
    pub postgres_pool_size: u32,

    /// Qdrant gRPC URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Qdrant collection / Neo4j vector index name
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// Neo4j Bolt URI
    #[serde(default = "default_neo4j_uri")]
    pub neo4j_uri: String,

    /// Neo4j username
    #[serde(default = "default_neo4j_user")]
    pub neo4j_user: String,

    /// Neo4j password
    #[serde(default = "default_neo4j_password")]
    pub neo4j_password: String,

    /// Neo4j database; server default when unset
    #[serde(default)]
    pub neo4j_database: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            postgres_host: default_postgres_host(),
            postgres_port: default_postgres_port(),
            postgres_database: default_postgres_database(),
            postgres_user: default_postgres_user(),
            postgres_password: default_postgres_password(),
            postgres_pool_size: default_postgres_pool_size(),
            qdrant_url: default_qdrant_url(),
            collection_name: default_collection_name(),
            neo4j_uri: default_neo4j_uri(),
            neo4j_user: default_neo4j_user(),
            neo4j_password: default_neo4j_password(),
            neo4j_database: None,
        }
    }
}

impl StorageConfig {
    /// Postgres connection URL
    pub fn postgres_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_host,
            self.postgres_port,
            self.postgres_database
        )
    }

    /// In-memory storage, for tests and dry runs
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("postgres_host", &self.postgres_host)
            .field("postgres_port", &self.postgres_port)
            .field("postgres_database", &self.postgres_database)
            .field("postgres_user", &self.postgres_user)
            .field("postgres_password", &"***REDACTED***")
            .field("postgres_pool_size", &self.postgres_pool_size)
            .field("qdrant_url", &self.qdrant_url)
            .field("collection_name", &self.collection_name)
            .field("neo4j_uri", &self.neo4j_uri)
            .field("neo4j_user", &self.neo4j_user)
            .field("neo4j_password", &"***REDACTED***")
            .field("neo4j_database", &self.neo4j_database)
            .finish()
    }
}

/// Configuration for file watching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Debounce time in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// File name patterns never reported (editor swap files and the like)
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

const VALID_EMBEDDING_PROVIDERS: [&str; 2] = ["openai_compatible", "mock"];
const VALID_STORAGE_BACKENDS: [&str; 3] = ["postgres", "neo4j", "memory"];

impl Config {
    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if !VALID_EMBEDDING_PROVIDERS.contains(&self.embeddings.provider.as_str()) {
            return Err(Error::config(format!(
                "Invalid embeddings provider '{}'. Must be one of: {:?}",
                self.embeddings.provider, VALID_EMBEDDING_PROVIDERS
            )));
        }

        if !VALID_STORAGE_BACKENDS.contains(&self.storage.backend.as_str()) {
            return Err(Error::config(format!(
                "Invalid storage backend '{}'. Must be one of: {:?}",
                self.storage.backend, VALID_STORAGE_BACKENDS
            )));
        }

        if self.embeddings.dimension == 0 {
            return Err(Error::config(
                "embeddings.dimension must be greater than 0".to_string(),
            ));
        }
        if self.embeddings.batch_size == 0 {
            return Err(Error::config(
                "embeddings.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.indexing.max_workers == 0 {
            return Err(Error::config(
                "indexing.max_workers must be greater than 0".to_string(),
            ));
        }
        if self.indexing.max_workers > 256 {
            return Err(Error::config(format!(
                "indexing.max_workers too large (max 256, got {})",
                self.indexing.max_workers
            )));
        }
        if self.indexing.max_attempts == 0 {
            return Err(Error::config(
                "indexing.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.indexing.retry_base_delay_ms > self.indexing.retry_max_delay_ms {
            return Err(Error::config(
                "indexing.retry_base_delay_ms must not exceed retry_max_delay_ms".to_string(),
            ));
        }

        if self.resolution.batch_size == 0 {
            return Err(Error::config(
                "resolution.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.resolution.max_attempts == 0 {
            return Err(Error::config(
                "resolution.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.files.include.is_empty() {
            return Err(Error::config(
                "files.include must contain at least one pattern".to_string(),
            ));
        }
        for pattern in self.files.include.iter().chain(&self.files.exclude) {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::config(format!("Invalid file pattern '{pattern}': {e}")))?;
        }

        let mut names = HashSet::new();
        for repository in &self.repositories {
            if repository.name.trim().is_empty() {
                return Err(Error::config("Repository name must not be empty".to_string()));
            }
            if !names.insert(repository.name.as_str()) {
                return Err(Error::config(format!(
                    "Duplicate repository name '{}'",
                    repository.name
                )));
            }
        }
        for repository in &self.repositories {
            for dependency in &repository.depends_on {
                if !names.contains(dependency.as_str()) {
                    return Err(Error::config(format!(
                        "Repository '{}' depends on unknown repository '{dependency}'",
                        repository.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Saves the configuration to a TOML file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, toml_string)
            .map_err(|e| Error::config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }
}
