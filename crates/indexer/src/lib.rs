//! Multi-repository indexing service
//!
//! Keeps the index of several repositories in sync with their working trees:
//!
//! - [`ChangeScanner`] finds new, modified and deleted files and queues them
//! - [`IndexingPipeline`] turns one queued file into entities, relations,
//!   pending references and vectors
//! - [`EventRouter`] queues watcher events without a rescan
//! - [`QueryService`] answers search, lookup and status queries
//! - [`Orchestrator`] wires everything together and runs the background loops

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod event_batcher;

pub mod event_router;
pub mod failure_policy;
pub mod filter;
pub mod orchestrator;
pub mod pipeline;
pub mod query;
pub mod scanner;
pub mod stats;
pub mod text_builder;

pub use event_router::EventRouter;
pub use failure_policy::{ErrorClass, FailurePolicy, RetryDecision};
pub use filter::FileFilter;
pub use orchestrator::{DrainReport, Orchestrator, RecoveryReport, RunReport, ServiceStatus};
pub use pipeline::{IndexOutcome, IndexingPipeline};
pub use query::{FileStatusEntry, QueryService, References, RepositoryStatusReport, SearchHit};
pub use scanner::{ChangeScanner, ScanReport};
pub use stats::StatsUpdater;
pub use text_builder::build_embedding_text;

// Re-export error types from core
pub use codeweave_core::error::{Error, Result};
