//! Schema for the default tables: `jobs`, `failed_jobs` and `tenants`.
//!
//! Timestamps are unix milliseconds. Queue connections configured with other
//! table names expect those tables to exist with the same columns.

use sqlx::migrate::Migrator;

pub static SQLITE_MIGRATOR: Migrator = sqlx_macros::migrate!("src/migrations_sqlite");
pub static POSTGRES_MIGRATOR: Migrator = sqlx_macros::migrate!("src/migrations_postgres");

pub fn sqlite_migrator() -> &'static Migrator {
    &SQLITE_MIGRATOR
}

pub fn postgres_migrator() -> &'static Migrator {
    &POSTGRES_MIGRATOR
}
