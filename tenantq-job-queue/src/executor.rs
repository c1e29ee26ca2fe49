//! Job handlers and the registry the dispatcher looks them up in.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::QueueError;
use crate::types::{JobId, TenantId};

/// Everything a handler knows about the job it is running.
///
/// `connection` is the tenant's connection (or the default one), already
/// resolved and valid for the duration of this execution only.
#[derive(Debug, Clone)]
pub struct JobContext<C> {
    pub job_id: JobId,
    pub queue: String,
    /// Attempts made before this one.
    pub attempts: u32,
    pub tenant: Option<TenantId>,
    pub connection: C,
}

/// Failure reported by a handler.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retryable: bool,
}

impl HandlerError {
    /// A failure that may succeed on a later attempt.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that no retry can fix. The job is dead-lettered immediately.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<HandlerError> for QueueError {
    fn from(err: HandlerError) -> Self {
        QueueError::Handler {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// Trait for implementing job handlers.
///
/// Each job type has one handler. Delivery is at-least-once, so a handler may
/// see the same job twice and should be idempotent.
#[async_trait]
pub trait JobHandler<C: Send + 'static>: Send + Sync {
    /// Returns the job type this handler handles.
    fn job_type(&self) -> &str;

    async fn execute(&self, ctx: JobContext<C>, args: Value) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    job_type: String,
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(job_type: impl Into<String>, func: F) -> Self {
        Self {
            job_type: job_type.into(),
            func,
        }
    }
}

#[async_trait]
impl<C, F, Fut> JobHandler<C> for FnHandler<F>
where
    C: Send + 'static,
    F: Fn(JobContext<C>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, ctx: JobContext<C>, args: Value) -> Result<(), HandlerError> {
        (self.func)(ctx, args).await
    }
}

/// A handler that completes every job without doing anything.
#[derive(Debug, Default, Clone)]
pub struct NoOpHandler {
    job_type: String,
}

impl NoOpHandler {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
        }
    }
}

#[async_trait]
impl<C: Send + 'static> JobHandler<C> for NoOpHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, _ctx: JobContext<C>, _args: Value) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handlers keyed by job type. Clones share the same registrations.
pub struct HandlerRegistry<C: Send + 'static> {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler<C>>>>>,
}

impl<C: Send + 'static> Clone for HandlerRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<C: Send + 'static> fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &"<RwLock<HashMap<String, Arc<dyn JobHandler>>>>")
            .finish()
    }
}

impl<C: Send + 'static> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + 'static> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler under its own job type, replacing any previous one.
    pub async fn register<H: JobHandler<C> + 'static>(&self, handler: H) {
        let job_type = handler.job_type().to_owned();
        let mut handlers = self.handlers.write().await;
        handlers.insert(job_type, Arc::new(handler));
    }

    /// Register an async closure for `job_type`.
    pub async fn register_fn<F, Fut>(&self, job_type: impl Into<String>, func: F)
    where
        F: Fn(JobContext<C>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(FnHandler::new(job_type, func)).await;
    }

    pub async fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler<C>>> {
        self.handlers.read().await.get(job_type).cloned()
    }

    pub async fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}
