//! Error kinds for the trend pipeline

use thiserror::Error;

/// Backing store failure
///
/// The store never retries; callers decide (the scheduler retries on its
/// next cycle).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Per-item failure inside a batch. Never aborts the batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("malformed item: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown item failure: {0}")]
    Unknown(String),
}

/// Fetch collaborator failure (the whole batch is unavailable)
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("source returned status {0}")]
    Status(u16),

    #[error("failed to decode source response: {0}")]
    Decode(String),
}

/// Run-level scheduler failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("ingest run failed: {0}")]
    IngestRunFailed(String),
}

/// Publish hook failure; logged by the broadcaster, never retried
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("no subscribers on channel {0}")]
    NoSubscribers(String),

    #[error("channel closed: {0}")]
    Closed(String),
}
