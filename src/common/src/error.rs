use thiserror::Error;

/// Failure reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("query timed out: {0}")]
    Timeout(String),
}

/// Reasons a record is refused by the insert pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InsertError {
    #[error("invalid record: no data")]
    BadData,
    #[error("invalid beginning timestamp: latency tracking needs a submission time")]
    BadBeginning,
    #[error("batch inserter is stopped")]
    Stopped,
}

/// Construction-time configuration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no {0}")]
    MissingCollaborator(&'static str),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
