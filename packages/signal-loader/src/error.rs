//! Typed errors for the signal loader.
//!
//! Uses `thiserror` for library errors (not `anyhow`). Lease contention is
//! not represented here: `try_acquire` returns `Ok(None)` for that.

use thiserror::Error;

/// Boxed error source shared by the collaborator variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while scheduling or executing a load.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Malformed job configuration. Never retried automatically.
    #[error("invalid job config: {0}")]
    Validation(String),

    /// Substitution input absent or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Could not reach the external source
    #[error("source connection failed for '{source_ref}': {source}")]
    SourceConnection {
        source_ref: String,
        #[source]
        source: BoxError,
    },

    /// The external source rejected or failed the query
    #[error("source query failed: {0}")]
    SourceQuery(#[source] BoxError),

    /// A result row could not be mapped to a signal record
    #[error("transformation failed at row {row}: {reason}")]
    Transformation { row: usize, reason: String },

    /// FAIL_ON_DUPLICATE found stored signals inside the window
    #[error("{existing} stored signals already cover the window for job '{job_code}'")]
    DuplicateWindow { job_code: String, existing: u64 },

    /// Downstream ingestion failed
    #[error("signal sink error: {0}")]
    Sink(#[source] BoxError),

    /// Coordination datastore failed
    #[error("storage error: {0}")]
    Storage(#[source] BoxError),

    /// The run exceeded the per-run execution timeout
    #[error("run exceeded execution timeout of {seconds}s")]
    Timeout { seconds: u64 },

    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl LoaderError {
    /// Stable label written into execution metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            LoaderError::Validation(_) => "validation",
            LoaderError::InvalidArgument(_) => "invalid_argument",
            LoaderError::SourceConnection { .. } => "source_connection",
            LoaderError::SourceQuery(_) => "source_query",
            LoaderError::Transformation { .. } => "transformation",
            LoaderError::DuplicateWindow { .. } => "duplicate_window",
            LoaderError::Sink(_) => "sink",
            LoaderError::Storage(_) => "storage",
            LoaderError::Timeout { .. } => "timeout",
            LoaderError::JobNotFound(_) => "job_not_found",
        }
    }

    /// Validation errors are rejected before scheduling and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(self, LoaderError::Validation(_))
    }

    pub fn sink(message: impl Into<String>) -> Self {
        let message: String = message.into();
        LoaderError::Sink(message.into())
    }

    pub fn source_query(message: impl Into<String>) -> Self {
        let message: String = message.into();
        LoaderError::SourceQuery(message.into())
    }
}

impl From<sqlx::Error> for LoaderError {
    fn from(err: sqlx::Error) -> Self {
        LoaderError::Storage(Box::new(err))
    }
}

impl From<sqlx::migrate::MigrateError> for LoaderError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        LoaderError::Storage(Box::new(err))
    }
}

/// Result type alias for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;
