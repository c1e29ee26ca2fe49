// Row types and executor-generic queries behind the SQL store and catalog.
// Table names are interpolated, so callers must pass validated identifiers.

use sqlx::{Executor, FromRow};

use crate::DbBackend;

const JOB_COLUMNS: &str =
    "id, queue, payload, tenant_id, attempts, reserved_at, available_at, created_at";
const FAILED_JOB_COLUMNS: &str = "id, queue, payload, tenant_id, attempts, reserved_at, \
     available_at, created_at, failed_at, last_error";

#[cfg(feature = "postgres")]
const RESERVE_LOCK: &str = "FOR UPDATE SKIP LOCKED";
// SQLite serializes writers, so the UPDATE alone is atomic.
#[cfg(feature = "sqlite")]
const RESERVE_LOCK: &str = "";

// Null-safe equality, used to match a reservation that may be NULL.
#[cfg(feature = "postgres")]
const SAME_AS: &str = "IS NOT DISTINCT FROM";
#[cfg(feature = "sqlite")]
const SAME_AS: &str = "IS";

/// A `jobs` row. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub queue: String,
    pub payload: Vec<u8>,
    pub tenant_id: Option<String>,
    pub attempts: i64,
    pub reserved_at: Option<i64>,
    pub available_at: i64,
    pub created_at: i64,
}

/// A `failed_jobs` row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct FailedJobRow {
    pub id: i64,
    pub queue: String,
    pub payload: Vec<u8>,
    pub tenant_id: Option<String>,
    pub attempts: i64,
    pub reserved_at: Option<i64>,
    pub available_at: i64,
    pub created_at: i64,
    pub failed_at: i64,
    pub last_error: String,
}

/// A `tenants` row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TenantRow {
    pub id: String,
    pub database_url: String,
    pub max_connections: Option<i64>,
}

pub mod jobs {
    use super::*;

    pub struct NewJob<'a> {
        pub queue: &'a str,
        pub payload: &'a [u8],
        pub tenant_id: Option<&'a str>,
        pub available_at: i64,
        pub created_at: i64,
    }

    pub async fn insert<'e, E>(executor: E, table: &str, job: &NewJob<'_>) -> Result<i64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!(
            "INSERT INTO {table} (queue, payload, tenant_id, attempts, reserved_at, available_at, created_at) \
             VALUES ($1, $2, $3, 0, NULL, $4, $5) RETURNING id"
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(job.queue)
            .bind(job.payload)
            .bind(job.tenant_id)
            .bind(job.available_at)
            .bind(job.created_at)
            .fetch_one(executor)
            .await
    }

    /// Marks the oldest reservable row of `queue` as reserved at `now` and returns it.
    ///
    /// A row is reservable when `available_at <= now` and it is unreserved or
    /// was reserved before `stale_before`. Reclaiming a stale reservation
    /// counts the abandoned attempt.
    pub async fn reserve_next<'e, E>(
        executor: E,
        table: &str,
        queue: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<Option<JobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!(
            r#"
            UPDATE {table}
            SET reserved_at = $1,
                attempts = attempts + CASE WHEN reserved_at IS NULL THEN 0 ELSE 1 END
            WHERE id = (
                SELECT id FROM {table}
                WHERE queue = $2
                  AND available_at <= $1
                  AND (reserved_at IS NULL OR reserved_at < $3)
                ORDER BY available_at, id
                LIMIT 1
                {RESERVE_LOCK}
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(queue)
            .bind(stale_before)
            .fetch_optional(executor)
            .await
    }

    pub async fn find<'e, E>(executor: E, table: &str, id: i64) -> Result<Option<JobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("SELECT {JOB_COLUMNS} FROM {table} WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Clears the reservation, counts the attempt and postpones the row to
    /// `available_at`. Only touches the row while it still carries `reserved_at`.
    pub async fn release<'e, E>(
        executor: E,
        table: &str,
        id: i64,
        reserved_at: Option<i64>,
        available_at: i64,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!(
            "UPDATE {table} SET reserved_at = NULL, attempts = attempts + 1, available_at = $2 \
             WHERE id = $1 AND reserved_at {SAME_AS} $3"
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(available_at)
            .bind(reserved_at)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete<'e, E>(executor: E, table: &str, id: i64) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        let result = sqlx::query(&sql).bind(id).execute(executor).await?;
        Ok(result.rows_affected())
    }

    /// Deletes a row still carrying `reserved_at` and returns what it held.
    pub async fn take<'e, E>(
        executor: E,
        table: &str,
        id: i64,
        reserved_at: Option<i64>,
    ) -> Result<Option<JobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!(
            "DELETE FROM {table} WHERE id = $1 AND reserved_at {SAME_AS} $2 RETURNING {JOB_COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(reserved_at)
            .fetch_optional(executor)
            .await
    }

    pub async fn count<'e, E>(executor: E, table: &str, queue: &str) -> Result<i64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE queue = $1");
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(queue)
            .fetch_one(executor)
            .await
    }

    pub async fn delete_queue<'e, E>(executor: E, table: &str, queue: &str) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("DELETE FROM {table} WHERE queue = $1");
        let result = sqlx::query(&sql).bind(queue).execute(executor).await?;
        Ok(result.rows_affected())
    }
}

pub mod failed_jobs {
    use super::*;

    pub async fn insert<'e, E>(executor: E, table: &str, row: &FailedJobRow) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!(
            "INSERT INTO {table} ({FAILED_JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        );
        sqlx::query(&sql)
            .bind(row.id)
            .bind(&row.queue)
            .bind(&row.payload)
            .bind(row.tenant_id.as_deref())
            .bind(row.attempts)
            .bind(row.reserved_at)
            .bind(row.available_at)
            .bind(row.created_at)
            .bind(row.failed_at)
            .bind(&row.last_error)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Most recently failed first.
    pub async fn list<'e, E>(executor: E, table: &str, limit: i64) -> Result<Vec<FailedJobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!(
            "SELECT {FAILED_JOB_COLUMNS} FROM {table} ORDER BY failed_at DESC, id DESC LIMIT $1"
        );
        sqlx::query_as::<_, FailedJobRow>(&sql)
            .bind(limit)
            .fetch_all(executor)
            .await
    }

    pub async fn find<'e, E>(executor: E, table: &str, id: i64) -> Result<Option<FailedJobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("SELECT {FAILED_JOB_COLUMNS} FROM {table} WHERE id = $1");
        sqlx::query_as::<_, FailedJobRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn take<'e, E>(executor: E, table: &str, id: i64) -> Result<Option<FailedJobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("DELETE FROM {table} WHERE id = $1 RETURNING {FAILED_JOB_COLUMNS}");
        sqlx::query_as::<_, FailedJobRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn delete<'e, E>(executor: E, table: &str, id: i64) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        let result = sqlx::query(&sql).bind(id).execute(executor).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all<'e, E>(executor: E, table: &str) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("DELETE FROM {table}");
        let result = sqlx::query(&sql).execute(executor).await?;
        Ok(result.rows_affected())
    }
}

pub mod tenants {
    use super::*;

    pub async fn find<'e, E>(executor: E, table: &str, id: &str) -> Result<Option<TenantRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("SELECT id, database_url, max_connections FROM {table} WHERE id = $1");
        sqlx::query_as::<_, TenantRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list<'e, E>(executor: E, table: &str) -> Result<Vec<TenantRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("SELECT id, database_url, max_connections FROM {table} ORDER BY id");
        sqlx::query_as::<_, TenantRow>(&sql).fetch_all(executor).await
    }

    pub async fn upsert<'e, E>(executor: E, table: &str, row: &TenantRow) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!(
            "INSERT INTO {table} (id, database_url, max_connections) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET database_url = excluded.database_url, \
             max_connections = excluded.max_connections"
        );
        sqlx::query(&sql)
            .bind(&row.id)
            .bind(&row.database_url)
            .bind(row.max_connections)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn delete<'e, E>(executor: E, table: &str, id: &str) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        let result = sqlx::query(&sql).bind(id).execute(executor).await?;
        Ok(result.rows_affected())
    }
}
