//! Git branch detection for watched repositories

use codeweave_core::{Error, Result};
use git2::Repository;
use std::path::Path;
use tracing::debug;

/// Name of the checked-out branch, or `detached:<short sha>` for a detached HEAD
fn head_branch(repo: &Repository) -> Result<String> {
    let head = repo
        .head()
        .map_err(|e| Error::watcher(format!("Failed to read HEAD: {e}")))?;
    if head.is_branch() {
        return head
            .shorthand()
            .map(str::to_string)
            .ok_or_else(|| Error::watcher("Branch name is not UTF-8"));
    }
    let oid = head
        .target()
        .ok_or_else(|| Error::watcher("HEAD points at nothing"))?;
    let sha = oid.to_string();
    Ok(format!("detached:{}", &sha[..sha.len().min(8)]))
}

/// Branch checked out in the working tree containing `path`
///
/// `None` when `path` is not inside a git working tree or HEAD is unborn.
pub fn detect_branch(path: &Path) -> Option<String> {
    let branch = Repository::discover(path)
        .map_err(|e| Error::watcher(format!("Not a git working tree: {e}")))
        .and_then(|repo| head_branch(&repo));
    match branch {
        Ok(branch) => Some(branch),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No git branch detected");
            None
        }
    }
}
