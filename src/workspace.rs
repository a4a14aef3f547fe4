use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempDir};
use tracing::{debug, info, warn};

use crate::domain::RunContext;
use crate::error::SyncError;
use crate::publish::publish_file_atomic;

/// A scoped local directory owned by one run.
///
/// Everything under the workspace is deleted when it is dropped or finished, except
/// files registered with [`Workspace::preserve`], which are moved to their destination first.
pub struct Workspace {
    dir: Option<TempDir>,
    root: Utf8PathBuf,
    preserved: Vec<(PathBuf, PathBuf)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub preserved: Vec<PathBuf>,
    pub removed: bool,
}

impl Workspace {
    pub fn create(root: &Utf8Path, ctx: &RunContext) -> Result<Self, SyncError> {
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let dir = Builder::new()
            .prefix(&format!("{}-{}-", ctx.job, ctx.run_id))
            .tempdir_in(root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|_| SyncError::Filesystem("non-utf8 workspace path".to_string()))?;
        debug!(job = %ctx.job, path = %root, "workspace created");
        Ok(Self {
            dir: Some(dir),
            root,
            preserved: Vec::new(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.root
    }

    /// Creates (if needed) and returns a sub-directory for one target.
    pub fn subdir(&self, name: &str) -> Result<PathBuf, SyncError> {
        let dir = self.root.as_std_path().join(name);
        fs::create_dir_all(&dir).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(dir)
    }

    /// Marks `artifact` (inside the workspace) to survive cleanup at `destination`.
    pub fn preserve(&mut self, artifact: &Path, destination: &Path) {
        self.preserved
            .push((artifact.to_path_buf(), destination.to_path_buf()));
    }

    pub fn finish(mut self) -> Result<CleanupReport, SyncError> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Result<CleanupReport, SyncError> {
        let mut report = CleanupReport::default();
        let Some(dir) = self.dir.take() else {
            return Ok(report);
        };
        let mut first_error = None;
        for (artifact, destination) in self.preserved.drain(..) {
            if !artifact.exists() {
                warn!(path = %artifact.display(), "preserved artifact was never written");
                continue;
            }
            match publish_file_atomic(&artifact, &destination) {
                Ok(()) => {
                    info!(path = %destination.display(), "preserved artifact");
                    report.preserved.push(destination);
                }
                Err(err) => {
                    warn!(path = %artifact.display(), error = %err, "failed to preserve artifact");
                    first_error.get_or_insert(err);
                }
            }
        }
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => {
                debug!(path = %path.display(), "workspace removed");
                report.removed = true;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to remove workspace");
                first_error.get_or_insert(SyncError::Filesystem(err.to_string()));
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.dir.is_some() {
            let _ = self.cleanup();
        }
    }
}

/// Exclusive per-job lock; a second run of the same job fails with [`SyncError::JobLocked`].
///
/// The lock file holds the owner's PID. A lock left behind by a process that no
/// longer exists is reclaimed.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(root: &Utf8Path, job: &str) -> Result<Self, SyncError> {
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let path = root.as_std_path().join(format!("{job}.lock"));
        match Self::create(&path) {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let Some(pid) = stale_owner(&path) else {
                    return Err(SyncError::JobLocked(job.to_string()));
                };
                warn!(job, pid, path = %path.display(), "reclaiming lock left by a dead process");
                fs::remove_file(&path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
                Self::create(&path).map_err(|err| lock_error(job, err))
            }
            result => result.map_err(|err| lock_error(job, err)),
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let lock = Self {
            path: path.to_path_buf(),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(lock)
    }
}

fn lock_error(job: &str, err: io::Error) -> SyncError {
    if err.kind() == io::ErrorKind::AlreadyExists {
        SyncError::JobLocked(job.to_string())
    } else {
        SyncError::Filesystem(err.to_string())
    }
}

/// PID recorded in the lock file, if that process is gone.
fn stale_owner(path: &Path) -> Option<u32> {
    let pid = fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()?;
    (!process_alive(pid)).then_some(pid)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;

    fn utf8(path: &Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new("sectors", Utc::now(), None);
        let path = {
            let workspace = Workspace::create(&utf8(temp.path()), &ctx).unwrap();
            let dir = workspace.subdir("bundle").unwrap();
            fs::write(dir.join("a.shp"), b"x").unwrap();
            workspace.path().as_std_path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn preserved_artifact_survives_cleanup() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new("merge", Utc::now(), None);
        let output = temp.path().join("out").join("merged_data.geojson");
        let mut workspace = Workspace::create(&utf8(&temp.path().join("ws")), &ctx).unwrap();
        let artifact = workspace.subdir("merge").unwrap().join("merged.geojson");
        fs::write(&artifact, b"{}").unwrap();
        workspace.preserve(&artifact, &output);
        let ws_path = workspace.path().as_std_path().to_path_buf();

        let report = workspace.finish().unwrap();
        assert!(report.removed);
        assert_eq!(report.preserved, vec![output.clone()]);
        assert_eq!(fs::read(&output).unwrap(), b"{}");
        assert!(!ws_path.exists());
    }

    #[test]
    fn second_lock_for_same_job_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        let lock = RunLock::acquire(&root, "impact-layers").unwrap();
        assert_matches!(
            RunLock::acquire(&root, "impact-layers").err(),
            Some(SyncError::JobLocked(_))
        );
        let _other = RunLock::acquire(&root, "hazard-rasters").unwrap();
        drop(lock);
        assert!(RunLock::acquire(&root, "impact-layers").is_ok());
    }

    #[test]
    fn lock_held_by_a_live_process_is_kept() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        fs::write(temp.path().join("sectors.lock"), format!("{}\n", std::process::id())).unwrap();
        assert_matches!(
            RunLock::acquire(&root, "sectors").err(),
            Some(SyncError::JobLocked(_))
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_left_by_a_dead_process_is_reclaimed() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        let path = temp.path().join("sectors.lock");
        fs::write(&path, format!("{}\n", u32::MAX)).unwrap();

        let lock = RunLock::acquire(&root, "sectors").unwrap();
        let owner = fs::read_to_string(&path).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
        drop(lock);
        assert!(!path.exists());
    }
}
