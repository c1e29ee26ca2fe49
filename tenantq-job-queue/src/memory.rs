//! In-memory job store.
//!
//! Useful for tests and single-process deployments. Records do not survive a
//! restart.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::store::JobStore;
use crate::types::{add_delay, FailedJobRecord, JobId, JobRecord, TenantId};

/// Internal storage. `jobs` is keyed by id so iteration follows insertion order.
#[derive(Debug, Default)]
struct MemoryQueueState {
    last_id: JobId,
    jobs: BTreeMap<JobId, JobRecord>,
    failed: BTreeMap<JobId, FailedJobRecord>,
}

impl MemoryQueueState {
    fn insert(
        &mut self,
        queue: &str,
        payload: Vec<u8>,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> JobId {
        self.last_id += 1;
        let id = self.last_id;
        self.jobs.insert(
            id,
            JobRecord {
                id,
                queue: queue.to_owned(),
                payload,
                tenant_id,
                attempts: 0,
                available_at: add_delay(now, delay),
                reserved_at: None,
                created_at: now,
            },
        );
        id
    }

    /// Oldest reservable record of `queue`: lowest `available_at`, then lowest id.
    fn next_reservable(&self, queue: &str, now: DateTime<Utc>, lease: Duration) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|job| job.queue == queue && job.is_reservable(now, lease))
            .min_by_key(|job| (job.available_at, job.id))
            .map(|job| job.id)
    }

    /// True if `job` still describes the current reservation of its record.
    fn holds_lease(&self, job: &JobRecord) -> bool {
        self.jobs
            .get(&job.id)
            .is_some_and(|stored| stored.reserved_at == job.reserved_at)
    }

    fn bury(
        &mut self,
        job: &JobRecord,
        now: DateTime<Utc>,
        last_error: &str,
        count_attempt: bool,
    ) -> bool {
        if !self.holds_lease(job) {
            return false;
        }
        let Some(mut stored) = self.jobs.remove(&job.id) else {
            return false;
        };
        if count_attempt {
            stored.attempts = stored.attempts.saturating_add(1);
        }
        self.failed
            .insert(job.id, FailedJobRecord::from_job(stored, now, last_error));
        true
    }
}

/// A [`JobStore`] kept entirely in process memory.
#[derive(Clone)]
pub struct MemoryJobStore {
    state: Arc<RwLock<MemoryQueueState>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryJobStore")
            .field("state", &"<RwLock<MemoryQueueState>>")
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryQueueState::default())),
            clock,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        tenant_id: Option<&TenantId>,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        Ok(state.insert(queue, payload, tenant_id.cloned(), now, delay))
    }

    async fn reserve_next(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let now = self.clock.now();
        // Selection and marking happen under the same write guard.
        let mut state = self.state.write().await;
        let Some(id) = state.next_reservable(queue, now, lease) else {
            return Ok(None);
        };
        Ok(state.jobs.get_mut(&id).map(|job| {
            if job.reserved_at.is_some() {
                job.attempts = job.attempts.saturating_add(1);
            }
            job.reserved_at = Some(now);
            job.clone()
        }))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        self.state.write().await.jobs.remove(&id);
        Ok(())
    }

    async fn release(&self, job: &JobRecord, backoff: Duration) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if !state.holds_lease(job) {
            return Ok(false);
        }
        let Some(stored) = state.jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        stored.reserved_at = None;
        stored.attempts = stored.attempts.saturating_add(1);
        stored.available_at = add_delay(now, backoff);
        Ok(true)
    }

    async fn dead_letter(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError> {
        let now = self.clock.now();
        Ok(self.state.write().await.bury(job, now, last_error, true))
    }

    async fn discard(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError> {
        let now = self.clock.now();
        Ok(self.state.write().await.bury(job, now, last_error, false))
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn size(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.state.read().await;
        Ok(state.jobs.values().filter(|job| job.queue == queue).count() as u64)
    }

    async fn clear(&self, queue: &str) -> Result<u64, QueueError> {
        let mut state = self.state.write().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| job.queue != queue);
        Ok((before - state.jobs.len()) as u64)
    }

    async fn failed(&self, limit: usize) -> Result<Vec<FailedJobRecord>, QueueError> {
        let state = self.state.read().await;
        let mut failed: Vec<FailedJobRecord> = state.failed.values().cloned().collect();
        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(b.id.cmp(&a.id)));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn find_failed(&self, id: JobId) -> Result<Option<FailedJobRecord>, QueueError> {
        Ok(self.state.read().await.failed.get(&id).cloned())
    }

    async fn retry_failed(&self, id: JobId) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let failed = state.failed.remove(&id).ok_or(QueueError::NotFound(id))?;
        Ok(state.insert(
            &failed.queue,
            failed.payload,
            failed.tenant_id,
            now,
            Duration::ZERO,
        ))
    }

    async fn forget_failed(&self, id: JobId) -> Result<bool, QueueError> {
        Ok(self.state.write().await.failed.remove(&id).is_some())
    }

    async fn flush_failed(&self) -> Result<u64, QueueError> {
        let mut state = self.state.write().await;
        let count = state.failed.len() as u64;
        state.failed.clear();
        Ok(count)
    }
}
