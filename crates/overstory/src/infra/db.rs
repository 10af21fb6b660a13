//! Shared `SQLite` plumbing for the four durable stores.
//!
//! Every store opens its own database file with WAL journaling, a 5 second
//! busy timeout, and a small connection pool, and checkpoints the WAL back
//! into the main file on close. Schema setup is idempotent DDL executed on
//! every open so column-add migrations are safe to re-run.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::{Error, Result};

pub mod events;
pub mod mail;
pub mod merge;
pub mod sessions;

/// Maximum number of pooled connections for one on-disk store.
///
/// A value greater than `1` lets the watchdog read sessions while the front
/// end writes them.
pub(crate) const DB_POOL_MAX_CONNECTIONS: u32 = 10;

/// How long a connection waits on a locked database before failing.
pub(crate) const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens one store database file, creating parent directories as needed.
pub(crate) async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            Error::store(
                format!("failed to create database directory: {err}"),
                &[("path", &parent.display().to_string())],
            )
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(DB_BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|err| {
            Error::store(
                format!("failed to open database: {err}"),
                &[("path", &db_path.display().to_string())],
            )
        })?;

    Ok(pool)
}

/// Opens a single-connection in-memory database for tests.
pub(crate) async fn open_pool_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(DB_BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|err| Error::store(format!("failed to open in-memory database: {err}"), &[]))?;

    Ok(pool)
}

/// Checkpoints the WAL into the main file and closes the pool.
pub(crate) async fn checkpoint_and_close(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(pool)
        .await?;
    pool.close().await;

    Ok(())
}

/// Adds a column if the table does not already have it.
///
/// `SQLite` has no `ADD COLUMN IF NOT EXISTS`; the duplicate-column error is
/// the idempotency signal and is the only error swallowed here.
pub(crate) async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column_ddl: &str,
) -> Result<()> {
    let ddl = format!("ALTER TABLE {table} ADD COLUMN {column_ddl}");
    match sqlx::query(&ddl).execute(pool).await {
        Ok(_) => Ok(()),
        Err(err) if err.to_string().contains("duplicate column name") => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Current Unix timestamp in whole seconds.
pub(crate) fn unix_timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| i64::try_from(duration.as_secs()).unwrap_or(0))
}

/// Current Unix timestamp in milliseconds.
pub(crate) fn unix_timestamp_ms_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| i64::try_from(duration.as_millis()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_column_if_missing_is_idempotent() {
        // Arrange
        let pool = open_pool_in_memory().await.expect("failed to open db");
        sqlx::query("CREATE TABLE widget (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .expect("failed to create table");

        // Act
        add_column_if_missing(&pool, "widget", "color TEXT")
            .await
            .expect("first add failed");
        let second = add_column_if_missing(&pool, "widget", "color TEXT").await;

        // Assert
        assert!(second.is_ok());
    }

    #[test]
    fn test_timestamps_are_consistent() {
        // Arrange & Act
        let secs = unix_timestamp_now();
        let millis = unix_timestamp_ms_now();

        // Assert — same clock, three orders of magnitude apart
        assert!(secs > 1_600_000_000);
        assert!((millis / 1_000 - secs).abs() <= 1);
    }
}
