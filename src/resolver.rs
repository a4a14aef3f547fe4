use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{PathTemplate, join_remote};
use crate::error::SyncError;
use crate::remote::RemoteSession;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDate {
    pub date: NaiveDate,
    pub path: String,
    pub offset: u32,
    pub is_fallback: bool,
}

/// Finds the most recent date whose rendered directory exists on the remote host.
#[derive(Debug, Clone)]
pub struct DateFallbackResolver {
    template: PathTemplate,
    max_lookback_days: u32,
    cycle_hour: u32,
    required_subdirs: Vec<String>,
}

impl DateFallbackResolver {
    pub fn new(template: PathTemplate, max_lookback_days: u32) -> Self {
        Self {
            template,
            max_lookback_days,
            cycle_hour: 0,
            required_subdirs: Vec::new(),
        }
    }

    pub fn with_cycle_hour(mut self, hour: u32) -> Self {
        self.cycle_hour = hour;
        self
    }

    /// Sub-directories that must also exist for a date to count (e.g. `HMC`).
    pub fn with_required_subdirs(mut self, subdirs: Vec<String>) -> Self {
        self.required_subdirs = subdirs;
        self
    }

    /// Probes `start`, `start - 1`, ... `start - max_lookback_days`, most recent first.
    pub fn resolve(
        &self,
        job: &str,
        session: &dyn RemoteSession,
        start: NaiveDate,
    ) -> Result<ResolvedDate, SyncError> {
        let mut oldest = start;
        for offset in 0..=self.max_lookback_days {
            let Some(candidate) = start.checked_sub_days(Days::new(u64::from(offset))) else {
                break;
            };
            oldest = candidate;
            let path = self.template.render(candidate, self.cycle_hour)?;
            if self.is_available(session, &path) {
                let is_fallback = offset > 0;
                if is_fallback {
                    warn!(job, date = %candidate, offset, path = %path, "using fallback date");
                } else {
                    info!(job, date = %candidate, path = %path, "data available for start date");
                }
                return Ok(ResolvedDate {
                    date: candidate,
                    path,
                    offset,
                    is_fallback,
                });
            }
            debug!(job, date = %candidate, path = %path, "no data for date");
        }
        Err(SyncError::NoDataAvailable {
            job: job.to_string(),
            newest: start.to_string(),
            oldest: oldest.to_string(),
        })
    }

    fn is_available(&self, session: &dyn RemoteSession, path: &str) -> bool {
        session.exists(path)
            && self
                .required_subdirs
                .iter()
                .all(|sub| session.exists(&join_remote(path, sub)))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::path::Path;

    use assert_matches::assert_matches;

    use super::*;

    struct ProbeLog {
        present: BTreeSet<String>,
        probed: RefCell<Vec<String>>,
    }

    impl RemoteSession for ProbeLog {
        fn exists(&self, path: &str) -> bool {
            self.probed.borrow_mut().push(path.to_string());
            self.present.contains(path)
        }

        fn list_files(&self, _dir: &str) -> Result<Vec<String>, SyncError> {
            Ok(Vec::new())
        }

        fn fetch(&self, remote_path: &str, _local_path: &Path) -> Result<u64, SyncError> {
            Err(SyncError::NotFound(remote_path.to_string()))
        }

        fn close(&mut self) {}
    }

    fn log(present: &[&str]) -> ProbeLog {
        ProbeLog {
            present: present.iter().map(|p| p.to_string()).collect(),
            probed: RefCell::new(Vec::new()),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn probes_most_recent_first_and_stops_at_first_hit() {
        let session = log(&["base/2025/01/07/00"]);
        let resolver = DateFallbackResolver::new(PathTemplate::new("base/{YYYY}/{MM}/{DD}/{HH}"), 7);
        let resolved = resolver.resolve("job", &session, date(2025, 1, 10)).unwrap();
        assert_eq!(resolved.date, date(2025, 1, 7));
        assert_eq!(resolved.offset, 3);
        assert!(resolved.is_fallback);
        assert_eq!(
            *session.probed.borrow(),
            vec![
                "base/2025/01/10/00",
                "base/2025/01/09/00",
                "base/2025/01/08/00",
                "base/2025/01/07/00",
            ]
        );
    }

    #[test]
    fn exhausted_window_is_no_data() {
        let session = log(&["base/2025/01/01/00"]);
        let resolver = DateFallbackResolver::new(PathTemplate::new("base/{YYYY}/{MM}/{DD}/00"), 2);
        let err = resolver.resolve("job", &session, date(2025, 1, 10)).unwrap_err();
        assert_matches!(err, SyncError::NoDataAvailable { ref oldest, .. } if oldest == "2025-01-08");
        assert_eq!(session.probed.borrow().len(), 3);
    }

    #[test]
    fn required_subdirectory_must_exist() {
        let session = log(&["r/20250110", "r/20250109", "r/20250109/HMC"]);
        let resolver = DateFallbackResolver::new(PathTemplate::new("r/{date}"), 3)
            .with_required_subdirs(vec!["HMC".to_string()]);
        let resolved = resolver.resolve("job", &session, date(2025, 1, 10)).unwrap();
        assert_eq!(resolved.date, date(2025, 1, 9));
    }
}
