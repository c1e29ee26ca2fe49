//! The storage contract every queue backend implements.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::types::{FailedJobRecord, JobId, JobRecord, TenantId};

/// Durable table of pending and leased jobs plus the failed-job table.
///
/// Implementations hold no business logic. The only synchronization point
/// between workers is [`JobStore::reserve_next`], which must select and mark a
/// record in one atomic step.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record that becomes reservable after `delay`.
    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        tenant_id: Option<&TenantId>,
        delay: Duration,
    ) -> Result<JobId, QueueError>;

    /// Lease the oldest reservable record of `queue`, if any.
    ///
    /// Reservable means `available_at <= now` and no lease younger than
    /// `lease`. Ties break on `available_at`, then `id`. Reclaiming a record
    /// whose lease expired counts the abandoned attempt in the same step.
    async fn reserve_next(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError>;

    /// Delete a record. Deleting an absent id is not an error.
    async fn complete(&self, id: JobId) -> Result<(), QueueError>;

    /// Drop the lease `job` was handed out with, count the failed attempt,
    /// and hide the record for `backoff`.
    ///
    /// Returns `false` and changes nothing when the record is gone or was
    /// reserved again after `job` was handed out.
    async fn release(&self, job: &JobRecord, backoff: Duration) -> Result<bool, QueueError>;

    /// Count the final failed attempt and move the record to the failed-job
    /// table. Same lease check as [`JobStore::release`].
    async fn dead_letter(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError>;

    /// Move the record to the failed-job table as is, without counting another
    /// attempt. Same lease check as [`JobStore::release`].
    async fn discard(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;

    /// Number of active records in `queue`, leased or not.
    async fn size(&self, queue: &str) -> Result<u64, QueueError>;

    /// Delete every active record in `queue`, returning how many were removed.
    async fn clear(&self, queue: &str) -> Result<u64, QueueError>;

    /// Failed jobs, most recently failed first.
    async fn failed(&self, limit: usize) -> Result<Vec<FailedJobRecord>, QueueError>;

    async fn find_failed(&self, id: JobId) -> Result<Option<FailedJobRecord>, QueueError>;

    /// Push a failed job back onto its queue as a fresh record.
    async fn retry_failed(&self, id: JobId) -> Result<JobId, QueueError>;

    async fn forget_failed(&self, id: JobId) -> Result<bool, QueueError>;

    async fn flush_failed(&self) -> Result<u64, QueueError>;
}
