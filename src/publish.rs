use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Temp file in the target directory, then rename over the target.
    #[default]
    AtomicRename,
    /// Explicit `.backup` copy restored on failure, for targets without atomic rename.
    BackupRestore,
}

pub fn publish_file(source: &Path, target: &Path, mode: PublishMode) -> Result<(), SyncError> {
    match mode {
        PublishMode::AtomicRename => publish_file_atomic(source, target),
        PublishMode::BackupRestore => {
            publish_with_backup(source, target, |from, to| fs::copy(from, to).map(|_| ()))
        }
    }
}

/// Copies `source` to a temp file beside `target` and renames it into place.
pub fn publish_file_atomic(source: &Path, target: &Path) -> Result<(), SyncError> {
    let parent = target
        .parent()
        .ok_or_else(|| SyncError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".floodsync-publish")
        .tempfile_in(parent)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    fs::copy(source, temp.path()).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.persist(target)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Writes `content` to `target` through a temp file in the same directory.
pub fn write_bytes_atomic(target: &Path, content: &[u8]) -> Result<(), SyncError> {
    let parent = target
        .parent()
        .ok_or_else(|| SyncError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".floodsync-write")
        .tempfile_in(parent)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.persist(target)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Copy of a previously published file, taken right before an overwrite.
#[derive(Debug)]
pub struct BackupArtifact {
    target: PathBuf,
    backup: PathBuf,
}

impl BackupArtifact {
    pub fn create(target: &Path) -> Result<Option<Self>, SyncError> {
        if !target.exists() {
            return Ok(None);
        }
        let backup = backup_path(target);
        fs::copy(target, &backup).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(Some(Self {
            target: target.to_path_buf(),
            backup,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.backup
    }

    pub fn restore(self) -> Result<(), SyncError> {
        fs::rename(&self.backup, &self.target)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        warn!(path = %self.target.display(), "restored previous file from backup");
        Ok(())
    }

    pub fn discard(self) -> Result<(), SyncError> {
        fs::remove_file(&self.backup).map_err(|err| SyncError::Filesystem(err.to_string()))
    }
}

pub fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// Backup, copy, then either discard the backup or restore it before surfacing the error.
pub fn publish_with_backup<F>(source: &Path, target: &Path, copy: F) -> Result<(), SyncError>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    let backup = BackupArtifact::create(target)?;
    match copy(source, target) {
        Ok(()) => {
            if let Some(backup) = backup {
                backup.discard()?;
            }
            info!(path = %target.display(), "published file");
            Ok(())
        }
        Err(err) => {
            let copy_error = SyncError::Filesystem(format!(
                "copy {} -> {}: {err}",
                source.display(),
                target.display()
            ));
            match backup {
                Some(backup) => backup.restore()?,
                None => {
                    if target.exists() {
                        fs::remove_file(target)
                            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                    }
                }
            }
            Err(copy_error)
        }
    }
}
