use thiserror::Error;

use crate::queue::EntryId;
use crate::store::RunId;

#[derive(Error, Debug)]
pub enum PerflabError {
    #[error("Queue entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Benchmark runner error: {0}")]
    Runner(String),

    #[error("Delete not confirmed: {0}")]
    DeleteNotConfirmed(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PerflabError {
    fn from(err: rusqlite::Error) -> Self {
        PerflabError::StoreUnavailable(format!("sqlite: {}", err))
    }
}

impl From<tokio::task::JoinError> for PerflabError {
    fn from(err: tokio::task::JoinError) -> Self {
        PerflabError::TaskFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PerflabError>;

/// Map a poisoned store lock into `StoreUnavailable`.
pub(crate) fn lock_poisoned<T>(_: std::sync::PoisonError<T>) -> PerflabError {
    PerflabError::StoreUnavailable("store lock poisoned".to_string())
}
