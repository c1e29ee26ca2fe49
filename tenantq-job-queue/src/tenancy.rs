//! Tenant context, catalog and connection resolution.
//!
//! The tenant that was implicit while handling a request is captured
//! explicitly at enqueue time ([`TenantContext`]) and turned back into a live
//! connection at execution time ([`ConnectionResolver`]). The connection only
//! lives for one job, inside a [`TenantScope`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QueueError;
use crate::types::TenantId;

/// Source of the tenant a job is being enqueued on behalf of.
pub trait TenantContext {
    fn current_tenant(&self) -> Option<TenantId>;
}

/// Context for work that belongs to no tenant; it runs on the default connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTenant;

impl TenantContext for NoTenant {
    fn current_tenant(&self) -> Option<TenantId> {
        None
    }
}

impl TenantContext for TenantId {
    fn current_tenant(&self) -> Option<TenantId> {
        Some(self.clone())
    }
}

impl TenantContext for Option<TenantId> {
    fn current_tenant(&self) -> Option<TenantId> {
        self.clone()
    }
}

impl<T: TenantContext + ?Sized> TenantContext for &T {
    fn current_tenant(&self) -> Option<TenantId> {
        (**self).current_tenant()
    }
}

/// Connection parameters for a tenant's backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub url: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub connection: ConnectionParams,
}

impl TenantRecord {
    pub fn new(id: impl Into<TenantId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection: ConnectionParams {
                url: url.into(),
                max_connections: None,
            },
        }
    }
}

/// Maps a tenant id to its connection parameters.
#[async_trait]
pub trait TenantCatalog: Send + Sync {
    async fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, QueueError>;
}

/// A fixed, in-memory catalog.
#[derive(Debug, Default, Clone)]
pub struct StaticTenantCatalog {
    tenants: Arc<HashMap<TenantId, TenantRecord>>,
}

impl StaticTenantCatalog {
    pub fn new(records: impl IntoIterator<Item = TenantRecord>) -> Self {
        records.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

impl FromIterator<TenantRecord> for StaticTenantCatalog {
    fn from_iter<I: IntoIterator<Item = TenantRecord>>(iter: I) -> Self {
        let tenants = iter
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            tenants: Arc::new(tenants),
        }
    }
}

#[async_trait]
impl TenantCatalog for StaticTenantCatalog {
    async fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, QueueError> {
        Ok(self.tenants.get(id).cloned())
    }
}

/// Turns a tenant id into a live connection handle.
///
/// Errors are [`QueueError::TenantNotFound`] for ids missing from the catalog
/// and [`QueueError::Connection`] when the backing store cannot be reached.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    type Connection: Clone + Send + Sync + 'static;

    async fn resolve(&self, tenant: &TenantId) -> Result<Self::Connection, QueueError>;

    /// The process-wide connection used by jobs without a tenant.
    async fn resolve_default(&self) -> Result<Self::Connection, QueueError>;

    /// Called once the job that used `connection` has finished.
    async fn release(&self, _connection: Self::Connection) {}
}

/// A connection activated for exactly one job execution.
pub struct TenantScope<'r, R: ConnectionResolver> {
    resolver: &'r R,
    tenant: Option<TenantId>,
    connection: R::Connection,
}

impl<'r, R: ConnectionResolver> TenantScope<'r, R> {
    /// Resolve `tenant`, or the default connection when `None`.
    pub async fn enter(resolver: &'r R, tenant: Option<&TenantId>) -> Result<Self, QueueError> {
        let connection = match tenant {
            Some(tenant) => resolver.resolve(tenant).await?,
            None => resolver.resolve_default().await?,
        };
        Ok(Self {
            resolver,
            tenant: tenant.cloned(),
            connection,
        })
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    pub fn connection(&self) -> &R::Connection {
        &self.connection
    }

    pub async fn release(self) {
        debug!(
            tenant = self.tenant.as_ref().map(TenantId::as_str).unwrap_or("-"),
            "releasing tenant connection scope"
        );
        self.resolver.release(self.connection).await;
    }
}
