//! Default values and functions for configuration

// Default constants
pub(crate) const DEFAULT_BRANCH: &str = "main";
pub(crate) const DEFAULT_EMBEDDING_PROVIDER: &str = "openai_compatible";
pub(crate) const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub(crate) const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/v1";
pub(crate) const DEFAULT_STORAGE_BACKEND: &str = "postgres";
pub(crate) const DEFAULT_POSTGRES_HOST: &str = "localhost";
pub(crate) const DEFAULT_POSTGRES_DATABASE: &str = "codeweave";
pub(crate) const DEFAULT_POSTGRES_USER: &str = "codeweave";
pub(crate) const DEFAULT_POSTGRES_PASSWORD: &str = "codeweave";
pub(crate) const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub(crate) const DEFAULT_COLLECTION_NAME: &str = "code_vectors";
pub(crate) const DEFAULT_NEO4J_URI: &str = "bolt://localhost:7687";
pub(crate) const DEFAULT_NEO4J_USER: &str = "neo4j";
pub(crate) const DEFAULT_NEO4J_PASSWORD: &str = "codeweave";

pub(crate) fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

pub(crate) fn default_include_patterns() -> Vec<String> {
    vec!["**/*.py".to_string()]
}

pub(crate) fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/__pycache__/**".to_string(),
        "**/.venv/**".to_string(),
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
    ]
}

pub(crate) fn default_respect_gitignore() -> bool {
    true
}

pub(crate) fn default_max_file_size_kb() -> u64 {
    1024
}

pub(crate) fn default_max_workers() -> usize {
    4
}

pub(crate) fn default_max_attempts() -> u32 {
    3
}

pub(crate) fn default_retry_base_delay_ms() -> u64 {
    5_000
}

pub(crate) fn default_retry_max_delay_ms() -> u64 {
    300_000
}

pub(crate) fn default_retry_interval_secs() -> u64 {
    60
}

pub(crate) fn default_stale_claim_secs() -> u64 {
    600
}

pub(crate) fn default_reconnect_attempts() -> u32 {
    5
}

pub(crate) fn default_shutdown_grace_secs() -> u64 {
    30
}

pub(crate) fn default_poll_interval_ms() -> u64 {
    500
}

pub(crate) fn default_watch() -> bool {
    true
}

pub(crate) fn default_resolution_interval_secs() -> u64 {
    60
}

pub(crate) fn default_resolution_batch_size() -> usize {
    100
}

pub(crate) fn default_resolution_max_attempts() -> u32 {
    5
}

pub(crate) fn default_embedding_provider() -> String {
    DEFAULT_EMBEDDING_PROVIDER.to_string()
}

pub(crate) fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

pub(crate) fn default_api_base_url() -> Option<String> {
    Some(DEFAULT_API_BASE_URL.to_string())
}

pub(crate) fn default_embedding_dimension() -> usize {
    1024
}

pub(crate) fn default_embedding_batch_size() -> usize {
    100
}

pub(crate) fn default_embedding_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_embedding_retry_attempts() -> usize {
    3
}

pub(crate) fn default_storage_backend() -> String {
    DEFAULT_STORAGE_BACKEND.to_string()
}

pub(crate) fn default_postgres_host() -> String {
    DEFAULT_POSTGRES_HOST.to_string()
}

pub(crate) fn default_postgres_port() -> u16 {
    5432
}

pub(crate) fn default_postgres_database() -> String {
    DEFAULT_POSTGRES_DATABASE.to_string()
}

pub(crate) fn default_postgres_user() -> String {
    DEFAULT_POSTGRES_USER.to_string()
}

pub(crate) fn default_postgres_password() -> String {
    DEFAULT_POSTGRES_PASSWORD.to_string()
}

pub(crate) fn default_postgres_pool_size() -> u32 {
    20
}

pub(crate) fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

pub(crate) fn default_collection_name() -> String {
    DEFAULT_COLLECTION_NAME.to_string()
}

pub(crate) fn default_neo4j_uri() -> String {
    DEFAULT_NEO4J_URI.to_string()
}

pub(crate) fn default_neo4j_user() -> String {
    DEFAULT_NEO4J_USER.to_string()
}

pub(crate) fn default_neo4j_password() -> String {
    DEFAULT_NEO4J_PASSWORD.to_string()
}

pub(crate) fn default_debounce_ms() -> u64 {
    500
}

pub(crate) fn default_ignore_patterns() -> Vec<String> {
    vec![
        "*.tmp".to_string(),
        "*.swp".to_string(),
        "*.swo".to_string(),
        "*~".to_string(),
        ".#*".to_string(),
        "*.pyc".to_string(),
    ]
}
