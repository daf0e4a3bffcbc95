//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for dubflow_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => dubflow_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => dubflow_core::Error::Conflict(msg),
            other => dubflow_core::Error::Internal(other.to_string()),
        }
    }
}
