//! Backup-then-replace for a single file, and its inverse.
//!
//! Every move is a copy followed by a delete of the source. The copy is
//! synced before the source goes away, so at any instant the old content
//! lives at `current_path`, at `backup_path`, or at both.

use crate::manifest::FileTarget;
use crate::{Result, UpdateError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Applies and reverts file replacements for one run.
///
/// Holds per-run state and must not be shared between runs.
#[derive(Debug, Default)]
pub struct FileTransactor {
    /// Directories known to exist
    known_dirs: HashSet<PathBuf>,
    /// `current_path`s whose pre-update state is fully preserved
    preserved: HashSet<PathBuf>,
}

impl FileTransactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `current_path` with the staged `new_path`, keeping the old
    /// content at `backup_path`.
    ///
    /// Errors propagate as-is; nothing is repaired here.
    pub async fn commit(&mut self, target: &FileTarget) -> Result<()> {
        for path in [&target.current_path, &target.new_path, &target.backup_path] {
            self.ensure_parent(path).await?;
        }

        // A leftover backup from an earlier run must never be restored by this one.
        remove_if_exists(&target.backup_path).await?;

        if exists(&target.current_path).await {
            copy_synced(&target.current_path, &target.backup_path).await?;
            self.preserved.insert(target.current_path.clone());
            remove(&target.current_path).await?;
            debug!(
                "Backed up {} to {}",
                target.current_path.display(),
                target.backup_path.display()
            );
        } else {
            // Nothing to preserve: rolling back means removing the file.
            self.preserved.insert(target.current_path.clone());
        }

        copy_synced(&target.new_path, &target.current_path).await?;
        remove(&target.new_path).await?;

        info!("Replaced {}", target.current_path.display());
        Ok(())
    }

    /// Restore the pre-commit state of `target`.
    pub async fn rollback(&self, target: &FileTarget) -> Result<()> {
        if exists(&target.current_path).await {
            remove(&target.current_path).await?;
        }

        if exists(&target.backup_path).await {
            copy_synced(&target.backup_path, &target.current_path).await?;
            remove(&target.backup_path).await?;
            info!("Restored {} from backup", target.current_path.display());
        }

        self.discard_staged(target).await
    }

    /// Undo whatever a failed [`commit`](Self::commit) left behind.
    ///
    /// If the backup was completed the target is rolled back in full.
    /// Otherwise the original is still in place and only the partial backup
    /// copy is removed.
    pub async fn recover_failed_commit(&self, target: &FileTarget) -> Result<()> {
        if self.preserved.contains(&target.current_path) {
            return self.rollback(target).await;
        }

        if exists(&target.current_path).await && exists(&target.backup_path).await {
            remove(&target.backup_path).await?;
        }
        Ok(())
    }

    /// Delete the backup once the run no longer needs it.
    pub async fn discard_backup(&self, target: &FileTarget) -> Result<()> {
        remove_if_exists(&target.backup_path).await
    }

    /// Delete a staged download that will not be installed.
    pub async fn discard_staged(&self, target: &FileTarget) -> Result<()> {
        remove_if_exists(&target.new_path).await
    }

    async fn ensure_parent(&mut self, path: &Path) -> Result<()> {
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        if self.known_dirs.contains(parent) {
            return Ok(());
        }

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| UpdateError::file_transaction(parent, e))?;
        self.known_dirs.insert(parent.to_path_buf());
        Ok(())
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Copy `from` to `to` and flush the copy to disk before returning.
async fn copy_synced(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| UpdateError::file_transaction(from, e))?;

    let copy = tokio::fs::OpenOptions::new()
        .write(true)
        .open(to)
        .await
        .map_err(|e| UpdateError::file_transaction(to, e))?;
    copy.sync_all()
        .await
        .map_err(|e| UpdateError::file_transaction(to, e))
}

async fn remove(path: &Path) -> Result<()> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| UpdateError::file_transaction(path, e))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            Err(UpdateError::file_transaction(path, e))
        }
    }
}
