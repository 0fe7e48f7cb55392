//! Single-instance guard for `codeweave serve`

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default lock location, next to the global configuration file
pub fn default_lock_path() -> Result<PathBuf> {
    let config = codeweave_core::config::global_config_path()?;
    Ok(config.with_file_name("serve.lock"))
}

/// Exclusive lock held for the lifetime of a running service
///
/// Released on drop, and by the OS if the process dies.
#[derive(Debug)]
pub struct ServiceLock {
    file: File,
    path: PathBuf,
}

impl ServiceLock {
    /// Take the lock at `path` without waiting
    ///
    /// # Errors
    /// Fails when another process holds the lock or the file cannot be opened
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::options()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|e| {
            anyhow!(
                "Another codeweave service is running (lock {} is held: {e})",
                path.display()
            )
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ServiceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "Failed to release service lock: {e}");
        }
    }
}
