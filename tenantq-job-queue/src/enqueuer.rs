//! Pushing jobs onto a queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::QueueError;
use crate::store::JobStore;
use crate::tenancy::TenantContext;
use crate::types::{JobId, TaskDescriptor, TenantId};

pub const DEFAULT_QUEUE: &str = "default";

/// Builds job records from task descriptors and writes them to a store.
///
/// The tenant is always taken from the context argument; the enqueuer never
/// touches connections.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    default_queue: String,
}

impl fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enqueuer")
            .field("store", &"<dyn JobStore>")
            .field("default_queue", &self.default_queue)
            .finish()
    }
}

impl Enqueuer {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            default_queue: DEFAULT_QUEUE.to_owned(),
        }
    }

    #[must_use]
    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Serialize `task` and store it on `queue` for `context`'s tenant.
    ///
    /// A `StorageError` means nothing durable was written; retrying is safe.
    pub async fn push<T>(
        &self,
        queue: &str,
        task: &TaskDescriptor,
        context: &T,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError>
    where
        T: TenantContext + ?Sized,
    {
        let tenant = context.current_tenant();
        let payload = task.to_payload()?;
        let id = self
            .store
            .enqueue(queue, payload, tenant.as_ref(), delay.unwrap_or_default())
            .await?;
        debug!(
            job_id = id,
            queue,
            job_type = %task.job_type,
            tenant = tenant.as_ref().map(TenantId::as_str).unwrap_or("-"),
            delay_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0),
            "job enqueued"
        );
        Ok(id)
    }

    pub async fn push_now<T>(
        &self,
        queue: &str,
        task: &TaskDescriptor,
        context: &T,
    ) -> Result<JobId, QueueError>
    where
        T: TenantContext + ?Sized,
    {
        self.push(queue, task, context, None).await
    }

    /// Push onto the enqueuer's default queue.
    pub async fn push_on_default<T>(&self, task: &TaskDescriptor, context: &T) -> Result<JobId, QueueError>
    where
        T: TenantContext + ?Sized,
    {
        self.push(&self.default_queue, task, context, None).await
    }
}
