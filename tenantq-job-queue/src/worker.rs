//! The dispatcher: reserves jobs, runs their handlers inside a tenant scope,
//! and settles each reservation as completed, released or dead-lettered.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::enqueuer::DEFAULT_QUEUE;
use crate::error::QueueError;
use crate::executor::{HandlerRegistry, JobContext};
use crate::manager::QueueConnectionConfig;
use crate::store::JobStore;
use crate::tenancy::{ConnectionResolver, TenantScope};
use crate::types::{JobId, JobRecord, TaskDescriptor, TenantId};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning for one worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Queues to poll, highest priority first.
    pub queues: Vec<String>,
    pub lease: Duration,
    /// Wait between polls that found nothing.
    pub poll_interval: Duration,
    /// Upper bound for the pause after repeated store failures.
    pub max_poll_backoff: Duration,
    pub max_attempts: u32,
    /// Execution limit for jobs whose descriptor sets none. Kept below `lease`.
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_connection(&QueueConnectionConfig::default())
    }
}

impl WorkerOptions {
    /// Options carrying the lease, attempt budget and backoff of a connection.
    pub fn from_connection(config: &QueueConnectionConfig) -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_owned()],
            lease: config.lease,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_backoff: DEFAULT_MAX_POLL_BACKOFF,
            max_attempts: config.max_attempts,
            timeout: DEFAULT_TIMEOUT,
            backoff: config.backoff.clone(),
        }
    }

    #[must_use]
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Execution limit for a job whose descriptor asks for `requested_secs`.
    ///
    /// Zero or absent falls back to `timeout`. A limit at or above the lease is
    /// cut to nine tenths of the lease so the job settles before it can be
    /// reclaimed.
    pub fn timeout_for(&self, requested_secs: Option<u64>) -> Duration {
        let wanted = requested_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        if wanted < self.lease {
            return wanted;
        }
        let capped = self.lease - self.lease / 10;
        warn!(
            requested_ms = wanted.as_millis() as u64,
            lease_ms = self.lease.as_millis() as u64,
            capped_ms = capped.as_millis() as u64,
            "job timeout reaches the lease, capping it"
        );
        capped
    }

    /// Pause after `consecutive` failed polls: the poll interval doubled per failure, capped.
    fn poll_backoff(&self, consecutive: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive.saturating_sub(1)).unwrap_or(u32::MAX);
        self.poll_interval
            .saturating_mul(factor)
            .min(self.max_poll_backoff)
    }
}

/// How a reservation was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        job_id: JobId,
    },
    /// Returned to the queue; `attempts` includes the attempt that just failed.
    Released {
        job_id: JobId,
        attempts: u32,
        delay: Duration,
        error: String,
    },
    DeadLettered {
        job_id: JobId,
        attempts: u32,
        error: String,
    },
    /// The lease expired and another worker reserved the job; nothing was settled.
    LeaseLost {
        job_id: JobId,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Completed { job_id }
            | Self::Released { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::LeaseLost { job_id } => *job_id,
        }
    }
}

/// Polls a store and executes what it reserves.
///
/// Clones share the store, resolver and handler registry, so a clone per
/// tokio task is how a pool of workers is built.
pub struct Worker<R: ConnectionResolver> {
    store: Arc<dyn JobStore>,
    resolver: Arc<R>,
    handlers: HandlerRegistry<R::Connection>,
    options: WorkerOptions,
}

impl<R: ConnectionResolver> Clone for Worker<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            handlers: self.handlers.clone(),
            options: self.options.clone(),
        }
    }
}

impl<R: ConnectionResolver> fmt::Debug for Worker<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("store", &"<dyn JobStore>")
            .field("handlers", &self.handlers)
            .field("options", &self.options)
            .finish()
    }
}

impl<R: ConnectionResolver + 'static> Worker<R> {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: Arc<R>,
        handlers: HandlerRegistry<R::Connection>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            store,
            resolver,
            handlers,
            options,
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn handlers(&self) -> &HandlerRegistry<R::Connection> {
        &self.handlers
    }

    /// Reserve and process at most one job.
    ///
    /// `Ok(None)` means every bound queue was empty. Errors come only from
    /// reservation; whatever happens to the job itself is in the outcome.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        for queue in &self.options.queues {
            if let Some(job) = self.store.reserve_next(queue, self.options.lease).await? {
                debug!(
                    job_id = job.id,
                    queue = %job.queue,
                    attempts = job.attempts,
                    "job reserved"
                );
                return Ok(Some(self.process(job).await));
            }
        }
        Ok(None)
    }

    /// Loop until `shutdown` is cancelled. A job in flight is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            queues = ?self.options.queues,
            lease_secs = self.options.lease.as_secs(),
            max_attempts = self.options.max_attempts,
            "worker started"
        );

        let mut consecutive_errors: u32 = 0;
        while !shutdown.is_cancelled() {
            let pause = match self.run_once().await {
                Ok(Some(_)) => {
                    consecutive_errors = 0;
                    continue;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    self.options.poll_interval
                }
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let pause = self.options.poll_backoff(consecutive_errors);
                    warn!(
                        error = %err,
                        consecutive_errors,
                        backoff_ms = pause.as_millis() as u64,
                        "polling the job store failed"
                    );
                    pause
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }

        info!(queues = ?self.options.queues, "worker stopped");
    }

    /// Run `concurrency` loops on their own tasks and wait for all of them to stop.
    pub async fn run_pool(&self, concurrency: usize, shutdown: CancellationToken) {
        let mut loops = JoinSet::new();
        for _ in 0..concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker.run(shutdown).await });
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }

    async fn process(&self, job: JobRecord) -> JobOutcome {
        let started = Instant::now();
        let task = match TaskDescriptor::from_payload(&job.payload) {
            Ok(task) => task,
            Err(err) => {
                let max_attempts = self.options.max_attempts;
                return self.settle(&job, Err(err), max_attempts, started.elapsed()).await;
            }
        };

        let max_attempts = task.max_attempts.unwrap_or(self.options.max_attempts);
        if job.attempts > 0 && job.attempts >= max_attempts {
            // Reclaimed after its holders used up the budget without settling.
            return self.discard(&job).await;
        }
        let result = self.execute(&job, task).await;
        self.settle(&job, result, max_attempts, started.elapsed()).await
    }

    async fn execute(&self, job: &JobRecord, task: TaskDescriptor) -> Result<(), QueueError> {
        let handler = self
            .handlers
            .get(&task.job_type)
            .await
            .ok_or_else(|| QueueError::UnknownJobType(task.job_type.clone()))?;

        let scope = TenantScope::enter(self.resolver.as_ref(), job.tenant_id.as_ref()).await?;
        let ctx = JobContext {
            job_id: job.id,
            queue: job.queue.clone(),
            attempts: job.attempts,
            tenant: job.tenant_id.clone(),
            connection: scope.connection().clone(),
        };
        let limit = self.options.timeout_for(task.timeout_secs);

        // Own task so a panicking handler fails the job instead of the loop.
        let mut running = tokio::spawn(async move { handler.execute(ctx, task.args).await });
        let result = match tokio::time::timeout(limit, &mut running).await {
            Ok(Ok(outcome)) => outcome.map_err(QueueError::from),
            Ok(Err(join_err)) => Err(QueueError::Handler {
                message: format!("handler panicked: {join_err}"),
                retryable: true,
            }),
            Err(_) => {
                running.abort();
                Err(QueueError::Timeout(limit))
            }
        };

        scope.release().await;
        result
    }

    async fn settle(
        &self,
        job: &JobRecord,
        result: Result<(), QueueError>,
        max_attempts: u32,
        elapsed: Duration,
    ) -> JobOutcome {
        let tenant = job.tenant_id.as_ref().map(TenantId::as_str).unwrap_or("-");
        let attempts = job.attempts.saturating_add(1);

        let err = match result {
            Ok(()) => {
                if let Err(store_err) = self.store.complete(job.id).await {
                    error!(job_id = job.id, error = %store_err, "failed to mark job completed");
                }
                info!(
                    job_id = job.id,
                    queue = %job.queue,
                    tenant,
                    attempts,
                    duration_ms = elapsed.as_millis() as u64,
                    "job completed"
                );
                return JobOutcome::Completed { job_id: job.id };
            }
            Err(err) => err,
        };

        let error = err.to_string();
        if err.is_retryable() && attempts < max_attempts {
            let delay = self.options.backoff.delay_for(job.attempts);
            warn!(
                job_id = job.id,
                queue = %job.queue,
                tenant,
                attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "job failed, will retry"
            );
            match self.store.release(job, delay).await {
                Ok(true) => {}
                Ok(false) => return self.lease_lost(job),
                Err(store_err) => {
                    error!(job_id = job.id, error = %store_err, "failed to release job");
                }
            }
            return JobOutcome::Released {
                job_id: job.id,
                attempts,
                delay,
                error,
            };
        }

        info!(
            job_id = job.id,
            queue = %job.queue,
            tenant,
            attempts,
            retryable = err.is_retryable(),
            error = %error,
            "job dead-lettered"
        );
        match self.store.dead_letter(job, &error).await {
            Ok(true) => {}
            Ok(false) => return self.lease_lost(job),
            Err(store_err) => {
                error!(job_id = job.id, error = %store_err, "failed to dead-letter job");
            }
        }
        JobOutcome::DeadLettered {
            job_id: job.id,
            attempts,
            error,
        }
    }

    async fn discard(&self, job: &JobRecord) -> JobOutcome {
        let error = QueueError::LeaseExhausted(job.attempts).to_string();
        info!(
            job_id = job.id,
            queue = %job.queue,
            attempts = job.attempts,
            error = %error,
            "job dead-lettered"
        );
        match self.store.discard(job, &error).await {
            Ok(true) => {}
            Ok(false) => return self.lease_lost(job),
            Err(store_err) => {
                error!(job_id = job.id, error = %store_err, "failed to dead-letter job");
            }
        }
        JobOutcome::DeadLettered {
            job_id: job.id,
            attempts: job.attempts,
            error,
        }
    }

    fn lease_lost(&self, job: &JobRecord) -> JobOutcome {
        warn!(
            job_id = job.id,
            queue = %job.queue,
            lease_secs = self.options.lease.as_secs(),
            "lease lost before the job settled, leaving it to its new holder"
        );
        JobOutcome::LeaseLost { job_id: job.id }
    }
}
