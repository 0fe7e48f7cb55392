//! Configuration loading from files and environment variables

use crate::error::{Error, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use std::path::Path;

use super::defaults::*;
use super::{global_config_path, Config};

/// Unprefixed variables honored for container setups, with the key each one sets
const CONVENTIONAL_ENV: &[(&str, &str)] = &[
    ("POSTGRES_HOST", "storage.postgres_host"),
    ("POSTGRES_PORT", "storage.postgres_port"),
    ("POSTGRES_PASSWORD", "storage.postgres_password"),
    ("NEO4J_PASSWORD", "storage.neo4j_password"),
    ("EMBEDDING_API_KEY", "embeddings.api_key"),
];

type Builder = ConfigBuilder<DefaultState>;

/// Selector keys get explicit defaults so a lone env override of a sibling
/// key still produces a complete section
fn with_section_defaults(builder: Builder) -> Result<Builder> {
    let defaults: [(&str, config::Value); 4] = [
        ("storage.backend", default_storage_backend().into()),
        ("embeddings.provider", default_embedding_provider().into()),
        ("indexing.max_workers", (default_max_workers() as i64).into()),
        (
            "resolution.max_attempts",
            (default_resolution_max_attempts() as i64).into(),
        ),
    ];
    defaults.into_iter().try_fold(builder, |builder, (key, value)| {
        builder
            .set_default(key, value)
            .map_err(|e| Error::config(format!("Invalid default for {key}: {e}")))
    })
}

fn with_conventional_env(builder: Builder) -> Result<Builder> {
    CONVENTIONAL_ENV
        .iter()
        .filter_map(|(var, key)| std::env::var(var).ok().map(|value| (*var, *key, value)))
        .try_fold(builder, |builder, (var, key, value)| {
            builder
                .set_override(key, value)
                .map_err(|e| Error::config(format!("Failed to apply {var}: {e}")))
        })
}

impl Config {
    /// Read `path` (when it exists) layered under `CODEWEAVE_*` variables
    ///
    /// Nested keys use a double underscore, e.g. `CODEWEAVE_STORAGE__BACKEND=neo4j`
    /// or `CODEWEAVE_INDEXING__MAX_WORKERS=8`. No validation happens here.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut builder = with_section_defaults(config::Config::builder())?;
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("CODEWEAVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let builder = with_conventional_env(builder)?;

        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::config(format!("Invalid configuration in {}: {e}", path.display())))
    }

    /// Parse a TOML document directly, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("Failed to parse TOML: {e}")))
    }

    /// Load and validate the configuration
    ///
    /// Later layers win: built-in defaults, then the file (`config_path` or
    /// `~/.codeweave/config.toml`), then environment variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => global_config_path()?,
        };
        let config = Self::from_file(&path)?;
        config.validate()?;
        Ok(config)
    }
}
