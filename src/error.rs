use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("existence check unavailable, batch aborted: {0}")]
    DedupUnavailable(String),

    #[error("fetch failed for {id}: {message}")]
    FetchFailed { id: String, message: String },

    #[error("metadata index write failed: {0}")]
    MergeWriteFailed(String),

    #[error("metadata index {key} changed during merge")]
    MergeConflict { key: String },

    #[error("metadata index read failed: {0}")]
    MetadataRead(String),

    #[error("catalog index write failed: {0}")]
    IndexWriteFailed(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("token request failed: {0}")]
    AuthHttp(String),

    #[error("identity service returned status {status}: {message}")]
    AuthStatus { status: u16, message: String },

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("graph API request failed: {0}")]
    GraphHttp(String),

    #[error("graph API returned status {status}: {message}")]
    GraphStatus { status: u16, message: String },

    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid footprint: {0}")]
    InvalidFootprint(String),

    #[error("invalid AOI geometry: {0}")]
    InvalidAoi(String),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("invalid catalog record: {0}")]
    InvalidRecord(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    #[error("AOI not found: {0}")]
    AoiNotFound(i64),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker pool error: {0}")]
    WorkerPool(String),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::DownloadHttp(_)
            | IngestError::ShortRead { .. }
            | IngestError::ObjectStore(_) => true,
            IngestError::DownloadStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Database(err.to_string())
    }
}
