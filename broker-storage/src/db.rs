//! The SQLite file behind [`crate::Storage`].
//!
//! The broker keeps one database per deployment. It is created on first start,
//! migrated on every start, and copied aside first so a bad migration can be
//! rolled back by hand.

use crate::error::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Concurrent provisions contend for the write lock; wait for it rather than
/// failing with `SQLITE_BUSY`.
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Connect to the broker database at `db_path`, creating the file and its
/// directory on first use. Tables are not touched; see [`run_migrations`].
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .busy_timeout(LOCK_WAIT);

    Ok(SqlitePool::connect_with(options).await?)
}

/// Bring the schema up to date. Already applied migrations are skipped.
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Snapshot an existing database next to itself as `<name>.db.backup.<unix time>`.
///
/// Nothing is written for a fresh install, in which case `None` is returned.
pub fn backup_database(db_path: &Path) -> Result<Option<PathBuf>> {
    if !db_path.exists() {
        return Ok(None);
    }

    let snapshot = db_path.with_extension(format!("db.backup.{}", now()));
    let copied = std::fs::copy(db_path, &snapshot)?;
    debug!(snapshot = %snapshot.display(), bytes = copied, "copied database");
    Ok(Some(snapshot))
}

/// Unix seconds, the unit of every `created_at`/`updated_at` column.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
