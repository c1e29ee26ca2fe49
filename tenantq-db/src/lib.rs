//! SQL backend for tenantq: the job store, the tenant catalog table, and the
//! resolver that opens one pool per tenant database.

#[cfg(not(any(feature = "postgres", feature = "sqlite")))]
compile_error!("Enable exactly one of the `postgres` or `sqlite` features for tenantq-db.");

#[cfg(all(feature = "postgres", feature = "sqlite"))]
compile_error!("Activate only one backend feature (`postgres` or `sqlite`) for tenantq-db.");

#[cfg(feature = "postgres")]
pub type DbBackend = sqlx::Postgres;
#[cfg(feature = "sqlite")]
pub type DbBackend = sqlx::Sqlite;

mod catalog;
mod handlers;
pub mod queries;
mod resolver;
mod store;

pub use catalog::SqlTenantCatalog;
pub use handlers::{PingHandler, PING_JOB_TYPE};
pub use resolver::PoolResolver;
pub use store::{validate_identifier, DatabaseConnector, SqlJobStore, DATABASE_DRIVER};

pub use tenantq_db_connection::{
    create_pool, sanitize_database_url, DbConnectionConfig, DbConnectionError, DbPool,
};

/// Create or update the `jobs`, `failed_jobs` and `tenants` tables.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    #[cfg(feature = "sqlite")]
    let migrator = tenantq_migrations::sqlite_migrator();
    #[cfg(feature = "postgres")]
    let migrator = tenantq_migrations::postgres_migrator();

    migrator.run(pool).await
}
