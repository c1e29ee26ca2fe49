#[cfg(feature = "postgres")]
use sqlx::postgres::{PgPool, PgPoolOptions};
#[cfg(feature = "sqlite")]
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use crate::config::DbConnectionConfig;
use crate::error::DbConnectionError;
use crate::utils::sanitize_database_url;

#[cfg(not(any(feature = "postgres", feature = "sqlite")))]
compile_error!("Enable exactly one of the `postgres` or `sqlite` features for tenantq-db-connection.");

#[cfg(all(feature = "postgres", feature = "sqlite"))]
compile_error!("Activate only one backend feature (`postgres` or `sqlite`) for tenantq-db-connection.");

#[cfg(feature = "postgres")]
pub type DbPool = PgPool;
#[cfg(feature = "sqlite")]
pub type DbPool = SqlitePool;

#[cfg(feature = "postgres")]
type DbPoolOptions = PgPoolOptions;
#[cfg(feature = "sqlite")]
type DbPoolOptions = SqlitePoolOptions;

/// Creates a new backend-specific connection pool using the provided configuration.
pub async fn create_pool(config: &DbConnectionConfig) -> Result<DbPool, DbConnectionError> {
    config.validate()?;
    let url = config.url.trim();

    // sqlx refuses to open a missing sqlite file, so create it (and its
    // directory) first.
    #[cfg(feature = "sqlite")]
    ensure_sqlite_db_file_exists(url)?;

    let mut opts = DbPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout());

    #[cfg(not(feature = "sqlite"))]
    {
        opts = opts.test_before_acquire(config.test_before_acquire);
    }

    if let Some(idle) = config.idle_timeout() {
        opts = opts.idle_timeout(idle);
    }

    match opts.connect(url).await {
        Ok(pool) => {
            debug!(
                database_url = %sanitize_database_url(url),
                max_connections = config.max_connections,
                "database pool created"
            );
            Ok(pool)
        }
        Err(err) => {
            warn!(
                database_url = %sanitize_database_url(url),
                error = %err,
                "database pool creation failed"
            );
            Err(err.into())
        }
    }
}

/// Extract the file path from a SQLite connection URL.
/// Returns None for in-memory databases or empty paths.
#[cfg(feature = "sqlite")]
fn sqlite_file_path(url: &str) -> Option<&str> {
    let lowered = url.to_ascii_lowercase();
    if SQLITE_MEMORY_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
    {
        return None;
    }

    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.strip_prefix("file:").unwrap_or(path);
    let path = path.split('?').next().unwrap_or(path).trim();
    if path.is_empty() {
        return None;
    }

    // "/C:/..." on Windows
    if path.len() > 2 && path.starts_with('/') && path.as_bytes().get(2) == Some(&b':') {
        Some(&path[1..])
    } else {
        Some(path)
    }
}

#[cfg(feature = "sqlite")]
fn ensure_sqlite_db_file_exists(database_url: &str) -> Result<(), DbConnectionError> {
    use std::fs::{create_dir_all, File};
    use std::io;
    use std::path::Path;

    let Some(clean_path) = sqlite_file_path(database_url) else {
        return Ok(());
    };

    let db_path = Path::new(clean_path);
    if let Some(parent) = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        create_dir_all(parent).map_err(|e| {
            DbConnectionError::FileCreation(format!(
                "failed to create parent directory '{}': {e}",
                parent.display()
            ))
        })?;
    }

    if !db_path.exists() {
        File::create(db_path).map_err(|e| {
            let msg = if e.kind() == io::ErrorKind::PermissionDenied {
                format!("permission denied creating '{}': {e}", db_path.display())
            } else {
                format!("failed to create DB file '{}': {e}", db_path.display())
            };
            DbConnectionError::FileCreation(msg)
        })?;
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
const SQLITE_MEMORY_PATTERNS: &[&str] = &[":memory:", "mode=memory"];

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;

    #[test]
    fn sqlite_paths() {
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("sqlite://file:jobs?mode=memory&cache=shared"), None);
        assert_eq!(sqlite_file_path("sqlite://data/jobs.db"), Some("data/jobs.db"));
        assert_eq!(sqlite_file_path("sqlite:jobs.db?mode=rwc"), Some("jobs.db"));
        assert_eq!(sqlite_file_path("sqlite:///C:/data/jobs.db"), Some("C:/data/jobs.db"));
    }

    #[tokio::test]
    async fn creates_missing_sqlite_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tenant.db");
        let config = DbConnectionConfig::new(format!("sqlite://{}", path.display()));

        let pool = create_pool(&config).await.unwrap();
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
        assert!(path.exists());
        pool.close().await;
    }

    #[tokio::test]
    async fn rejects_empty_url() {
        let config = DbConnectionConfig::new("   ");
        assert!(matches!(
            create_pool(&config).await,
            Err(DbConnectionError::EmptyDatabaseUrl)
        ));
    }
}
