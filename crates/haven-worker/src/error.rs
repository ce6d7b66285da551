use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("bad job payload: {0}")]
    BadPayload(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    Store(#[from] haven_store::error::StoreError),
}

impl WorkerError {
    /// Transient failures are retried with backoff; everything else goes to
    /// the dead-letter state on first failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkerError::Database(_) | WorkerError::Store(haven_store::error::StoreError::Database(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
