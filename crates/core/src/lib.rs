//! Core types and traits for the codeweave multi-repository indexer
//!
//! This crate provides the foundational abstractions used throughout the
//! workspace, including:
//!
//! - **Entities**: code entities, relations, pending references and vectors
//! - **State**: repositories, tracked files and file tasks
//! - **Extraction**: the pluggable parser capability
//! - **Configuration**: system configuration management
//! - **Health**: failure tracking for background loops
//! - **Error handling**: unified error types
//!

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod config;
pub mod entities;
pub mod error;
pub mod extraction;
pub mod hashing;
pub mod health;
pub mod state;

// Re-export main types for convenience
pub use config::{
    Config, EmbeddingsConfig, FilesConfig, IndexingConfig, RepositoryConfig, ResolutionConfig,
    StorageConfig, WatcherConfig,
};
pub use entities::{
    cosine_similarity, CodeEntity, CodeEntityBuilder, CodeRelation, EntityKind, Language,
    PendingReference, ReferenceStatus, RelationKind, ScoredVector, SearchFilters, SourceSpan,
    UnresolvedReference, VectorMetadata, VectorRecord, Visibility,
};
pub use error::{Error, Result, ResultExt};
pub use extraction::{ExtractionResult, Extractor};
pub use hashing::content_checksum;
pub use health::{HealthStatus, LoopHealth};
pub use state::{
    file_id_for, repository_id_for, ChangeKind, FileStatus, FileStatusCounts, FileTask,
    IndexedFile, QueuedTask, Repository, RepositoryStats, RepositoryStatus,
};

/// Version of the core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
