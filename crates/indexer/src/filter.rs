//! Include/exclude rules deciding which files are indexed

use codeweave_core::{Error, FilesConfig, Result};
use glob::Pattern;
use std::path::{Component, Path};

/// Compiled `files` section of the configuration
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    max_file_size: u64,
    respect_gitignore: bool,
}

impl FileFilter {
    /// Compile the configured glob patterns
    ///
    /// # Errors
    /// Returns a configuration error naming the first invalid pattern
    pub fn from_config(config: &FilesConfig) -> Result<Self> {
        Ok(Self {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
            max_file_size: config.max_file_size_bytes(),
            respect_gitignore: config.respect_gitignore,
        })
    }

    /// Whether a repository-relative, `/`-separated path is selected
    pub fn is_included(&self, relative_path: &str) -> bool {
        self.include.iter().any(|p| p.matches(relative_path))
            && !self.exclude.iter().any(|p| p.matches(relative_path))
    }

    pub fn within_size_limit(&self, file_size: u64) -> bool {
        file_size <= self.max_file_size
    }

    pub fn respect_gitignore(&self) -> bool {
        self.respect_gitignore
    }
}

/// `root`-relative, `/`-separated form of `path`; `None` outside `root`
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| Error::config(format!("Invalid file pattern '{p}': {e}")))
        })
        .collect()
}
