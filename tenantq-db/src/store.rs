//! [`JobStore`] on a SQL database.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tenantq_job_queue::{
    Clock, Connector, FailedJobRecord, JobId, JobRecord, JobStore, QueueConnectionConfig,
    QueueError, SystemClock, TenantId,
};
use tracing::debug;

use crate::queries::{self, FailedJobRow, JobRow};
use crate::DbPool;

pub const DATABASE_DRIVER: &str = "database";

const MAX_IDENTIFIER_LEN: usize = 63;

/// Stores jobs in `table` and dead letters in `failed_table` of one database.
///
/// Both tables must have the layout created by `tenantq-migrations`.
#[derive(Clone)]
pub struct SqlJobStore {
    pool: DbPool,
    table: String,
    failed_table: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SqlJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlJobStore")
            .field("table", &self.table)
            .field("failed_table", &self.failed_table)
            .field("clock", &self.clock)
            .finish()
    }
}

impl SqlJobStore {
    /// A store on the default `jobs` and `failed_jobs` tables.
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            table: "jobs".to_owned(),
            failed_table: "failed_jobs".to_owned(),
            clock: Arc::new(SystemClock),
        }
    }

    /// A store on the tables named by `config`.
    pub fn from_config(pool: DbPool, config: &QueueConnectionConfig) -> Result<Self, QueueError> {
        validate_identifier(&config.table)?;
        validate_identifier(&config.failed_table)?;
        Ok(Self {
            table: config.table.clone(),
            failed_table: config.failed_table.clone(),
            ..Self::new(pool)
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn failed_table(&self) -> &str {
        &self.failed_table
    }
}

impl SqlJobStore {
    /// Move the row `job` was reserved as into the failed table, adding `extra_attempts`.
    async fn bury(
        &self,
        job: &JobRecord,
        last_error: &str,
        extra_attempts: u32,
    ) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let reserved_at = job.reserved_at.map(to_millis);
        let Some(row) = queries::jobs::take(&mut *tx, &self.table, job.id, reserved_at)
            .await
            .map_err(storage_error)?
        else {
            return Ok(false);
        };
        let mut record = row.into_record()?;
        record.attempts = record.attempts.saturating_add(extra_attempts);
        let failed = FailedJobRow::from_record(&FailedJobRecord::from_job(record, now, last_error));
        queries::failed_jobs::insert(&mut *tx, &self.failed_table, &failed)
            .await
            .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        debug!(job_id = job.id, table = %self.failed_table, "job moved to failed table");
        Ok(true)
    }
}

#[async_trait]
impl JobStore for SqlJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        tenant_id: Option<&TenantId>,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let job = queries::jobs::NewJob {
            queue,
            payload: &payload,
            tenant_id: tenant_id.map(TenantId::as_str),
            available_at: to_millis(later(now, delay)),
            created_at: to_millis(now),
        };
        queries::jobs::insert(&self.pool, &self.table, &job)
            .await
            .map_err(storage_error)
    }

    async fn reserve_next(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let now = to_millis(self.clock.now());
        let stale_before = now.saturating_sub(duration_millis(lease));
        let row = queries::jobs::reserve_next(&self.pool, &self.table, queue, now, stale_before)
            .await
            .map_err(storage_error)?;
        row.map(JobRow::into_record).transpose()
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        queries::jobs::delete(&self.pool, &self.table, id)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn release(&self, job: &JobRecord, backoff: Duration) -> Result<bool, QueueError> {
        let available_at = to_millis(later(self.clock.now(), backoff));
        let reserved_at = job.reserved_at.map(to_millis);
        let updated =
            queries::jobs::release(&self.pool, &self.table, job.id, reserved_at, available_at)
                .await
                .map_err(storage_error)?;
        Ok(updated > 0)
    }

    async fn dead_letter(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError> {
        self.bury(job, last_error, 1).await
    }

    async fn discard(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError> {
        self.bury(job, last_error, 0).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        queries::jobs::find(&self.pool, &self.table, id)
            .await
            .map_err(storage_error)?
            .map(JobRow::into_record)
            .transpose()
    }

    async fn size(&self, queue: &str) -> Result<u64, QueueError> {
        let count = queries::jobs::count(&self.pool, &self.table, queue)
            .await
            .map_err(storage_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn clear(&self, queue: &str) -> Result<u64, QueueError> {
        queries::jobs::delete_queue(&self.pool, &self.table, queue)
            .await
            .map_err(storage_error)
    }

    async fn failed(&self, limit: usize) -> Result<Vec<FailedJobRecord>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        queries::failed_jobs::list(&self.pool, &self.failed_table, limit)
            .await
            .map_err(storage_error)?
            .into_iter()
            .map(FailedJobRow::into_record)
            .collect()
    }

    async fn find_failed(&self, id: JobId) -> Result<Option<FailedJobRecord>, QueueError> {
        queries::failed_jobs::find(&self.pool, &self.failed_table, id)
            .await
            .map_err(storage_error)?
            .map(FailedJobRow::into_record)
            .transpose()
    }

    async fn retry_failed(&self, id: JobId) -> Result<JobId, QueueError> {
        let now = to_millis(self.clock.now());
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let failed = queries::failed_jobs::take(&mut *tx, &self.failed_table, id)
            .await
            .map_err(storage_error)?
            .ok_or(QueueError::NotFound(id))?;
        let job = queries::jobs::NewJob {
            queue: &failed.queue,
            payload: &failed.payload,
            tenant_id: failed.tenant_id.as_deref(),
            available_at: now,
            created_at: now,
        };
        let new_id = queries::jobs::insert(&mut *tx, &self.table, &job)
            .await
            .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        Ok(new_id)
    }

    async fn forget_failed(&self, id: JobId) -> Result<bool, QueueError> {
        let deleted = queries::failed_jobs::delete(&self.pool, &self.failed_table, id)
            .await
            .map_err(storage_error)?;
        Ok(deleted > 0)
    }

    async fn flush_failed(&self) -> Result<u64, QueueError> {
        queries::failed_jobs::delete_all(&self.pool, &self.failed_table)
            .await
            .map_err(storage_error)
    }
}

/// Builds [`SqlJobStore`]s for the `database` driver, all on one pool.
#[derive(Clone)]
pub struct DatabaseConnector {
    pool: DbPool,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DatabaseConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnector")
            .field("clock", &self.clock)
            .finish()
    }
}

impl DatabaseConnector {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Connector for DatabaseConnector {
    async fn connect(&self, config: &QueueConnectionConfig) -> Result<Arc<dyn JobStore>, QueueError> {
        let store = SqlJobStore::from_config(self.pool.clone(), config)?
            .with_clock(Arc::clone(&self.clock));
        Ok(Arc::new(store))
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> Result<(), QueueError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start
        && name.len() <= MAX_IDENTIFIER_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(QueueError::InvalidConfig(format!(
            "'{name}' is not a valid table name"
        )))
    }
}

impl JobRow {
    pub fn into_record(self) -> Result<JobRecord, QueueError> {
        Ok(JobRecord {
            id: self.id,
            queue: self.queue,
            payload: self.payload,
            tenant_id: self.tenant_id.map(TenantId::new),
            attempts: to_attempts(self.attempts)?,
            available_at: from_millis(self.available_at)?,
            reserved_at: self.reserved_at.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
        })
    }
}

impl FailedJobRow {
    pub fn from_record(record: &FailedJobRecord) -> Self {
        Self {
            id: record.id,
            queue: record.queue.clone(),
            payload: record.payload.clone(),
            tenant_id: record.tenant_id.as_ref().map(|t| t.as_str().to_owned()),
            attempts: i64::from(record.attempts),
            reserved_at: record.reserved_at.map(to_millis),
            available_at: to_millis(record.available_at),
            created_at: to_millis(record.created_at),
            failed_at: to_millis(record.failed_at),
            last_error: record.last_error.clone(),
        }
    }

    pub fn into_record(self) -> Result<FailedJobRecord, QueueError> {
        Ok(FailedJobRecord {
            id: self.id,
            queue: self.queue,
            payload: self.payload,
            tenant_id: self.tenant_id.map(TenantId::new),
            attempts: to_attempts(self.attempts)?,
            available_at: from_millis(self.available_at)?,
            reserved_at: self.reserved_at.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
            failed_at: from_millis(self.failed_at)?,
            last_error: self.last_error,
        })
    }
}

pub(crate) fn storage_error(err: sqlx::Error) -> QueueError {
    QueueError::Storage(err.to_string())
}

#[inline]
fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| QueueError::Storage(format!("timestamp {millis} is out of range")))
}

fn to_attempts(attempts: i64) -> Result<u32, QueueError> {
    u32::try_from(attempts)
        .map_err(|_| QueueError::Storage(format!("attempt count {attempts} is out of range")))
}

#[inline]
fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// `now + delay`, saturating at the latest representable instant.
fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(validate_identifier("jobs").is_ok());
        assert!(validate_identifier("_billing_jobs2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2jobs").is_err());
        assert!(validate_identifier("jobs; DROP TABLE tenants").is_err());
        assert!(validate_identifier(&"j".repeat(64)).is_err());
    }

    #[test]
    fn row_conversion_checks_ranges() {
        let row = JobRow {
            id: 9,
            queue: "default".into(),
            payload: b"{}".to_vec(),
            tenant_id: Some("acme".into()),
            attempts: 2,
            reserved_at: None,
            available_at: 1_700_000_000_000,
            created_at: 1_700_000_000_000,
        };
        let record = row.clone().into_record().unwrap();
        assert_eq!(record.tenant_id, Some(TenantId::from("acme")));
        assert_eq!(record.attempts, 2);
        assert_eq!(to_millis(record.available_at), 1_700_000_000_000);

        let negative = JobRow { attempts: -1, ..row };
        assert!(matches!(negative.into_record(), Err(QueueError::Storage(_))));
    }

    #[test]
    fn huge_delays_saturate() {
        let now = Utc::now();
        assert_eq!(later(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(DateTime::from_timestamp_millis(to_millis(DateTime::<Utc>::MAX_UTC)).is_some());
    }
}
