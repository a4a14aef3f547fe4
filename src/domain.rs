use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z]+)\}").expect("static placeholder regex"));

/// A remote or local path with `{YYYY}`, `{MM}`, `{DD}`, `{HH}` and `{date}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_dated(&self) -> bool {
        PLACEHOLDER.is_match(&self.0)
    }

    pub fn render(&self, date: NaiveDate, hour: u32) -> Result<String, SyncError> {
        let mut unknown = None;
        let rendered = PLACEHOLDER.replace_all(&self.0, |caps: &Captures<'_>| match &caps[1] {
            "YYYY" => format!("{:04}", date.year()),
            "MM" => format!("{:02}", date.month()),
            "DD" => format!("{:02}", date.day()),
            "HH" => format!("{hour:02}"),
            "date" => date_stamp(date),
            other => {
                unknown.get_or_insert_with(|| other.to_string());
                String::new()
            }
        });
        if let Some(name) = unknown {
            return Err(SyncError::Template {
                template: self.0.clone(),
                message: format!("unknown placeholder {{{name}}}"),
            });
        }
        Ok(rendered.into_owned())
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Joins remote path segments with `/`, ignoring empty segments and duplicate separators.
pub fn join_remote(base: &str, segment: &str) -> String {
    let base = base.trim_end_matches('/');
    let segment = segment.trim_matches('/');
    match (base.is_empty(), segment.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => segment.to_string(),
        (false, false) => format!("{base}/{segment}"),
    }
}

/// Per-run values threaded through every stage instead of module-level state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub job: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub cycle_hour: u32,
}

impl RunContext {
    pub fn new(job: &str, started_at: DateTime<Utc>, today: Option<NaiveDate>) -> Self {
        Self {
            job: job.to_string(),
            run_id: started_at.format("%Y%m%dT%H%M%S%.3f").to_string(),
            started_at,
            today: today.unwrap_or_else(|| started_at.date_naive()),
            cycle_hour: 0,
        }
    }
}

/// Which files make up a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FileBundle {
    /// `<base_name><suffix>` for each declared suffix.
    Suffixes {
        base_name: PathTemplate,
        critical: Vec<String>,
        #[serde(default)]
        optional: Vec<String>,
    },
    /// Every file in the directory ending in `extension`.
    Listing { extension: String },
}

impl FileBundle {
    pub fn shapefile(base_name: impl Into<String>) -> Self {
        FileBundle::Suffixes {
            base_name: PathTemplate::new(base_name),
            critical: vec![".shp".to_string(), ".shx".to_string(), ".dbf".to_string()],
            optional: vec![".prj".to_string()],
        }
    }

    pub fn single(base_name: impl Into<String>, suffix: &str) -> Self {
        FileBundle::Suffixes {
            base_name: PathTemplate::new(base_name),
            critical: vec![suffix.to_string()],
            optional: Vec::new(),
        }
    }
}
