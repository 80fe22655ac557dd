use thiserror::Error;

/// Failures of the graph store's persistence layer.
///
/// None of these invalidate the in-memory graph; callers report them and
/// carry on with the run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to replace snapshot file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("journal connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("journal database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
