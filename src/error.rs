use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("remote host unreachable: {0}")]
    Connection(String),

    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("downloaded file is empty: {0}")]
    EmptyFile(String),

    #[error("transfer failed for {path}: {message}")]
    Transfer { path: String, message: String },

    #[error("failed to parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error("no geometry matches join key {key}={value}")]
    JoinMismatch { key: String, value: String },

    #[error("row {row} column {column}: {message}")]
    Validation {
        row: usize,
        column: String,
        message: String,
    },

    #[error("catalog returned status {status} for {product}: {message}")]
    Publish {
        product: String,
        status: u16,
        message: String,
    },

    #[error("no data for job {job} between {oldest} and {newest}")]
    NoDataAvailable {
        job: String,
        newest: String,
        oldest: String,
    },

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid path template {template}: {message}")]
    Template { template: String, message: String },

    #[error("missing configuration value: {0}")]
    Config(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid job definition {job}: {message}")]
    InvalidJob { job: String, message: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job {0} is already running (lock file present)")]
    JobLocked(String),

    #[error("job {0} finished with zero successful targets")]
    NoSuccessfulTargets(String),
}

impl SyncError {
    /// Errors worth another attempt with backoff. 4xx and missing files are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transfer { .. } => true,
            SyncError::Publish { status, .. } => *status >= 500,
            SyncError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Missing and zero-byte files are handled the same way by bundle policies.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_) | SyncError::EmptyFile(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Store(err.to_string())
    }
}
