//! Shared SQLite pool for the transcript log and the artifact store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use proto::DatabaseError;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

/// How long a writer waits for SQLite's write lock before failing.
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(30);

/// Expands a leading `~` to `$HOME`.
pub fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        path.replacen('~', &home, 1)
    } else {
        path.to_string()
    }
}

/// Opens (or creates) the database file and runs migrations.
///
/// WAL with `synchronous = FULL` so a committed artifact version survives a
/// crash right after `put` returns.
pub async fn open_pool(db_path: &str) -> Result<SqlitePool, DatabaseError> {
    let path = expand_home(db_path);

    if let Some(parent) = Path::new(&path).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(|e| DatabaseError::Sqlx(format!("invalid SQLite path: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(WRITE_LOCK_WAIT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

    run_migrations(&pool).await?;
    info!("SQLite database opened: {path}");
    Ok(pool)
}

/// In-memory database, mainly for tests. Single connection so every query
/// sees the same database.
pub async fn open_in_memory() -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), DatabaseError> {
    let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path())
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    migrator
        .run(pool)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_only_touches_leading_tilde() {
        let expanded = expand_home("~/studio.db");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("/studio.db"));
        assert_eq!(expand_home("/tmp/a~b.db"), "/tmp/a~b.db");
    }

    #[tokio::test]
    async fn open_pool_creates_parent_dir_and_tables() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("nested/dir/studio.db");
        let pool = open_pool(&path.to_string_lossy())
            .await
            .expect("pool should open");
        assert!(path.exists());

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('artifacts', 'messages', 'conversations')",
        )
        .fetch_one(&pool)
        .await
        .expect("query tables");
        assert_eq!(count, 3);
    }
}
