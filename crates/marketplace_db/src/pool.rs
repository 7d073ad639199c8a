//! Sqlite pool construction.
//!
//! Two independent pools are created by the binary at startup: one for the
//! JobStore (in-process authoritative state) and one standing in for the
//! external system-of-record RDS that `StatusReconciler` mirrors into. Both
//! go through this same constructor; which one a caller gets is purely a
//! matter of which URL it's pointed at.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::error::{DbError, Result};

/// Open (creating if absent) a sqlite pool at `url`, e.g. `sqlite://./data/jobs.db`
/// or `sqlite::memory:` for tests.
pub async fn open_sqlite_pool(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(DbError::Sqlx)?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode=WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

    info!(url, "opened sqlite pool");
    Ok(pool)
}
