//! File-based locking to keep the daemon single-instance.
//!
//! Two daemons disagreeing about shard indexes and strike state would
//! corrupt both; an advisory flock on a well-known path prevents it.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Holds the exclusive instance lock; released on drop.
pub struct LockGuard {
    _file: File,
}

impl LockGuard {
    /// Acquire the exclusive lock at `path`, failing if another instance
    /// holds it.
    ///
    /// The file is opened create+read+write without truncation so there
    /// is no window between creation and lock acquisition.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "another strikegated instance is already running (lock file: {})",
                path.display()
            )
        })?;

        Ok(Self { _file: file })
    }
}
