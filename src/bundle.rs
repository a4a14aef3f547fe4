use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{FileBundle, join_remote};
use crate::error::SyncError;
use crate::remote::RemoteSession;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleResult {
    pub complete: bool,
    /// Suffix (or file name, for listing bundles) to the downloaded local path.
    pub files: BTreeMap<String, PathBuf>,
    pub failure: Option<String>,
}

impl BundleResult {
    fn incomplete(files: BTreeMap<String, PathBuf>, reason: String) -> Self {
        Self {
            complete: false,
            files,
            failure: Some(reason),
        }
    }

    pub fn file(&self, key: &str) -> Option<&Path> {
        self.files.get(key).map(PathBuf::as_path)
    }
}

/// Downloads one bundle into a local directory, applying the critical/optional policy.
pub struct BundleFetcher<'a> {
    session: &'a dyn RemoteSession,
}

impl<'a> BundleFetcher<'a> {
    pub fn new(session: &'a dyn RemoteSession) -> Self {
        Self { session }
    }

    /// Only connection loss is returned as `Err`; every other failure yields an
    /// incomplete [`BundleResult`] so sibling bundles keep going.
    pub fn fetch(
        &self,
        remote_dir: &str,
        bundle: &FileBundle,
        date: NaiveDate,
        hour: u32,
        dest: &Path,
    ) -> Result<BundleResult, SyncError> {
        fs::create_dir_all(dest).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        match bundle {
            FileBundle::Suffixes {
                base_name,
                critical,
                optional,
            } => {
                let base = base_name.render(date, hour)?;
                self.fetch_suffixes(remote_dir, &base, critical, optional, dest)
            }
            FileBundle::Listing { extension } => self.fetch_listing(remote_dir, extension, dest),
        }
    }

    fn fetch_suffixes(
        &self,
        remote_dir: &str,
        base: &str,
        critical: &[String],
        optional: &[String],
        dest: &Path,
    ) -> Result<BundleResult, SyncError> {
        let mut files = BTreeMap::new();
        for suffix in critical {
            let name = format!("{base}{suffix}");
            match self.fetch_one(remote_dir, &name, dest) {
                Ok(path) => {
                    files.insert(suffix.clone(), path);
                }
                Err(err @ SyncError::Connection(_)) => return Err(err),
                Err(err) => {
                    warn!(bundle = base, suffix = %suffix, error = %err, "critical file unavailable, bundle incomplete");
                    return Ok(BundleResult::incomplete(files, err.to_string()));
                }
            }
        }
        for suffix in optional {
            let name = format!("{base}{suffix}");
            match self.fetch_one(remote_dir, &name, dest) {
                Ok(path) => {
                    files.insert(suffix.clone(), path);
                }
                Err(err @ SyncError::Connection(_)) => return Err(err),
                Err(err) => {
                    warn!(bundle = base, suffix = %suffix, error = %err, "optional file skipped");
                }
            }
        }
        info!(bundle = base, files = files.len(), "bundle complete");
        Ok(BundleResult {
            complete: true,
            files,
            failure: None,
        })
    }

    fn fetch_listing(
        &self,
        remote_dir: &str,
        extension: &str,
        dest: &Path,
    ) -> Result<BundleResult, SyncError> {
        let names = match self.session.list_files(remote_dir) {
            Ok(names) => names,
            Err(err @ SyncError::Connection(_)) => return Err(err),
            Err(err) => return Ok(BundleResult::incomplete(BTreeMap::new(), err.to_string())),
        };
        let wanted = extension.to_ascii_lowercase();
        let mut files = BTreeMap::new();
        for name in names
            .into_iter()
            .filter(|name| name.to_ascii_lowercase().ends_with(&wanted))
        {
            match self.fetch_one(remote_dir, &name, dest) {
                Ok(path) => {
                    files.insert(name, path);
                }
                Err(err @ SyncError::Connection(_)) => return Err(err),
                Err(err) => warn!(file = %name, error = %err, "skipping listed file"),
            }
        }
        if files.is_empty() {
            return Ok(BundleResult::incomplete(
                files,
                format!("no {extension} files in {remote_dir}"),
            ));
        }
        info!(dir = remote_dir, files = files.len(), "listing bundle complete");
        Ok(BundleResult {
            complete: true,
            files,
            failure: None,
        })
    }

    fn fetch_one(&self, remote_dir: &str, name: &str, dest: &Path) -> Result<PathBuf, SyncError> {
        let remote_path = join_remote(remote_dir, name);
        let local_path = dest.join(name);
        let bytes = match self.session.fetch(&remote_path, &local_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&local_path);
                return Err(err);
            }
        };
        if bytes == 0 {
            let _ = fs::remove_file(&local_path);
            return Err(SyncError::EmptyFile(remote_path));
        }
        debug!(path = %remote_path, bytes, "downloaded");
        Ok(local_path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    struct Files(BTreeMap<String, Vec<u8>>);

    impl RemoteSession for Files {
        fn exists(&self, path: &str) -> bool {
            self.0.contains_key(path)
        }

        fn list_files(&self, dir: &str) -> Result<Vec<String>, SyncError> {
            let prefix = format!("{dir}/");
            Ok(self
                .0
                .keys()
                .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
                .collect())
        }

        fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, SyncError> {
            let bytes = self
                .0
                .get(remote_path)
                .ok_or_else(|| SyncError::NotFound(remote_path.to_string()))?;
            fs::write(local_path, bytes).unwrap();
            Ok(bytes.len() as u64)
        }

        fn close(&mut self) {}
    }

    fn files(entries: &[(&str, &[u8])]) -> Files {
        Files(
            entries
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
                .collect(),
        )
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 9).unwrap()
    }

    #[test]
    fn missing_optional_suffix_keeps_bundle_complete() {
        let session = files(&[
            ("d/202501090000_FPimpacts-GDP.shp", b"s"),
            ("d/202501090000_FPimpacts-GDP.shx", b"x"),
            ("d/202501090000_FPimpacts-GDP.dbf", b"d"),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let bundle = FileBundle::shapefile("{date}0000_FPimpacts-GDP");
        let result = BundleFetcher::new(&session)
            .fetch("d", &bundle, date(), 0, temp.path())
            .unwrap();
        assert!(result.complete);
        assert_eq!(result.files.len(), 3);
        assert!(result.file(".prj").is_none());
    }

    #[test]
    fn empty_critical_file_makes_bundle_incomplete() {
        let session = files(&[
            ("d/layer.shp", b"s"),
            ("d/layer.shx", b""),
            ("d/layer.dbf", b"d"),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let result = BundleFetcher::new(&session)
            .fetch("d", &FileBundle::shapefile("layer"), date(), 0, temp.path())
            .unwrap();
        assert!(!result.complete);
        assert!(result.failure.as_deref().unwrap().contains("empty"));
        assert!(!temp.path().join("layer.shx").exists());
        assert!(result.file(".dbf").is_none());
    }

    #[test]
    fn listing_bundle_filters_by_extension() {
        let session = files(&[
            ("json/a.json", b"[]"),
            ("json/b.JSON", b"{}"),
            ("json/readme.txt", b"x"),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let bundle = FileBundle::Listing {
            extension: ".json".to_string(),
        };
        let result = BundleFetcher::new(&session)
            .fetch("json", &bundle, date(), 0, temp.path())
            .unwrap();
        assert!(result.complete);
        assert_eq!(
            result.files.keys().cloned().collect::<Vec<_>>(),
            vec!["a.json", "b.JSON"]
        );
    }

    #[test]
    fn empty_listing_is_incomplete() {
        let session = files(&[("json/readme.txt", b"x")]);
        let temp = tempfile::tempdir().unwrap();
        let bundle = FileBundle::Listing {
            extension: ".json".to_string(),
        };
        let result = BundleFetcher::new(&session)
            .fetch("json", &bundle, date(), 0, temp.path())
            .unwrap();
        assert!(!result.complete);
    }
}
