//! Database layer for Dubflow.
//!
//! Sole authority over durable task state. SQLite via sqlx; all readers and
//! writers go through the [`TaskStore`] trait.

pub mod error;
pub mod store;

pub use error::{DbError, DbResult};
pub use store::{NewTask, SqliteTaskStore, TaskStore};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::time::Duration;

/// Create a new database connection pool. Creates the database file when it
/// does not exist yet.
pub async fn create_pool(database_url: &str) -> DbResult<SqlitePool> {
    let options = database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
