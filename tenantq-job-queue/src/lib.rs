//! Persistent, tenant-aware job queue.
//!
//! Jobs are written to a [`JobStore`] by an [`Enqueuer`] together with the
//! tenant they were created for, and executed later by a [`Worker`] that leases
//! them one at a time. Before a handler runs, the worker resolves the job's
//! tenant into a live connection through a [`ConnectionResolver`] and hands it
//! to the handler for that execution only.
//!
//! # Architecture
//!
//! - [`JobStore`] - Durable table of jobs with atomic lease-based reservation
//! - [`MemoryJobStore`] - In-process store, used by the `memory` driver and tests
//! - [`QueueManager`] - Named connections, each backed by a driver's [`Connector`]
//! - [`Enqueuer`] - Serializes a [`TaskDescriptor`] and captures the tenant
//! - [`Worker`] - Reserve, resolve, execute, then complete, release or dead-letter
//! - [`HandlerRegistry`] - Job handlers keyed by job type
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use tenantq_job_queue::{
//!     async_trait, ConnectionResolver, Enqueuer, HandlerRegistry, MemoryJobStore, QueueError,
//!     TaskDescriptor, TenantId, Worker, WorkerOptions,
//! };
//!
//! struct Labels;
//!
//! #[async_trait]
//! impl ConnectionResolver for Labels {
//!     type Connection = String;
//!
//!     async fn resolve(&self, tenant: &TenantId) -> Result<String, QueueError> {
//!         Ok(format!("tenant-{tenant}"))
//!     }
//!
//!     async fn resolve_default(&self) -> Result<String, QueueError> {
//!         Ok("central".to_owned())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let store = Arc::new(MemoryJobStore::new());
//!     let handlers = HandlerRegistry::<String>::new();
//!     handlers
//!         .register_fn("report.build", |ctx, args| async move {
//!             println!("building {args} on {}", ctx.connection);
//!             Ok(())
//!         })
//!         .await;
//!
//!     let enqueuer = Enqueuer::new(store.clone());
//!     let task = TaskDescriptor::new("report.build", json!({"month": 3}));
//!     enqueuer.push_now("default", &task, &TenantId::from(42u64)).await?;
//!
//!     let worker = Worker::new(store, Arc::new(Labels), handlers, WorkerOptions::default());
//!     worker.run_once().await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod clock;
mod enqueuer;
mod error;
mod executor;
mod manager;
mod memory;
mod store;
mod tenancy;
mod types;
mod worker;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use enqueuer::{Enqueuer, DEFAULT_QUEUE};
pub use error::QueueError;
pub use executor::{FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler, NoOpHandler};
pub use manager::{
    Connector, MemoryConnector, QueueConnection, QueueConnectionConfig, QueueManager, MEMORY_DRIVER,
};
pub use memory::MemoryJobStore;
pub use store::JobStore;
pub use tenancy::{
    ConnectionParams, ConnectionResolver, NoTenant, StaticTenantCatalog, TenantCatalog,
    TenantContext, TenantRecord, TenantScope,
};
pub use types::{FailedJobRecord, JobId, JobRecord, TaskDescriptor, TenantId};
pub use worker::{JobOutcome, Worker, WorkerOptions};

// Re-export async_trait for convenience when implementing JobHandler or ConnectionResolver
pub use async_trait::async_trait;
