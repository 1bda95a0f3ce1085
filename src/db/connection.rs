use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SyncResult;

pub type DbPool = SqlitePool;

pub async fn create_db_pool<P: AsRef<Path>>(db_path: P) -> SyncResult<DbPool> {
    let db_path = db_path.as_ref();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    // WAL lets readers keep a consistent snapshot while a writer commits.
    // The busy timeout makes writers wait on transient locks instead of failing.
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    crate::db::migrations::run_migrations(&pool).await?;
    info!("Database ready at {}", db_path.display());

    Ok(pool)
}

/// Single-connection pool over a private in-memory database.
///
/// Every SQLite memory connection is its own database, so the pool must never
/// open a second connection or recycle the first one.
pub async fn create_in_memory_pool() -> SyncResult<DbPool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}
