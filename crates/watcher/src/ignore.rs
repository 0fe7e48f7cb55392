//! Ignore rules applied before events reach the debouncer

use codeweave_core::{Error, Result};
use glob::Pattern;
use std::path::{Component, Path};
use tracing::trace;

/// Directories whose contents never produce events
const IGNORED_DIRS: [&str; 4] = [".git", "__pycache__", ".venv", "node_modules"];

/// Matches editor temp files and build droppings
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    patterns: Vec<Pattern>,
}

impl IgnoreFilter {
    pub fn from_patterns(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| Error::watcher(format!("Invalid ignore pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether a repository-relative path is ignored
    ///
    /// Patterns are tried against the file name and the whole relative path.
    pub fn should_ignore(&self, relative_path: &Path) -> bool {
        let in_ignored_dir = relative_path.components().any(|c| match c {
            Component::Normal(name) => IGNORED_DIRS.iter().any(|d| name == *d),
            _ => false,
        });
        if in_ignored_dir {
            return true;
        }

        let file_name = relative_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let full = relative_path.to_string_lossy();
        let ignored = self
            .patterns
            .iter()
            .any(|p| p.matches(&file_name) || p.matches(&full));
        if ignored {
            trace!(path = %full, "Ignoring path");
        }
        ignored
    }
}
