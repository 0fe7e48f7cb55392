#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! File system watching for incremental indexing
//!
//! One `notify` watcher per repository root. Raw events are filtered through
//! the ignore rules, debounced per path and emitted as
//! [`RepositoryEvent`]s carrying repository-relative paths.
//!
//! # Example
//!
//! ```no_run
//! use codeweave_core::WatcherConfig;
//! use codeweave_watcher::RepositoryWatcher;
//! use std::path::Path;
//!
//! # async fn example() -> codeweave_core::Result<()> {
//! let (mut watcher, mut events) = RepositoryWatcher::new(&WatcherConfig::default())?;
//! watcher.watch("repo-id", Path::new("/path/to/project")).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.change, event.relative_path);
//! }
//! # Ok(())
//! # }
//! ```

mod debouncer;
mod events;
mod git;
mod ignore;
mod watcher;

pub use events::RepositoryEvent;
pub use git::detect_branch;
pub use ignore::IgnoreFilter;
pub use watcher::RepositoryWatcher;
