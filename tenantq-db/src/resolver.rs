//! Per-tenant connection pools.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tenantq_db_connection::{create_pool, sanitize_database_url, DbConnectionConfig};
use tenantq_job_queue::{ConnectionResolver, QueueError, TenantCatalog, TenantId};
use tracing::{debug, info};

use crate::DbPool;

/// Resolves tenants to pools opened from their catalog entry.
///
/// Pools are opened on first use and cached; a handler receives a clone of
/// the cached pool, which is cheap and shares the underlying connections.
/// Jobs without a tenant run on the default pool.
pub struct PoolResolver {
    catalog: Arc<dyn TenantCatalog>,
    default_pool: DbPool,
    /// Pool settings for tenant databases; `url` is replaced per tenant.
    base: DbConnectionConfig,
    pools: DashMap<TenantId, DbPool>,
}

impl fmt::Debug for PoolResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolResolver")
            .field("catalog", &"<dyn TenantCatalog>")
            .field("tenant_max_connections", &self.base.max_connections)
            .field("cached_pools", &self.pools.len())
            .finish()
    }
}

impl PoolResolver {
    pub fn new(catalog: Arc<dyn TenantCatalog>, default_pool: DbPool, base: DbConnectionConfig) -> Self {
        Self {
            catalog,
            default_pool,
            base,
            pools: DashMap::new(),
        }
    }

    pub fn cached_pools(&self) -> usize {
        self.pools.len()
    }

    /// Forget a tenant's pool, e.g. after its catalog entry changed.
    /// The next job for that tenant opens a fresh one.
    pub async fn evict(&self, tenant: &TenantId) -> bool {
        let Some((_, pool)) = self.pools.remove(tenant) else {
            return false;
        };
        pool.close().await;
        debug!(tenant = %tenant, "tenant pool evicted");
        true
    }

    /// Close every cached tenant pool. The default pool is left open.
    pub async fn close_all(&self) {
        let tenants: Vec<TenantId> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for tenant in tenants {
            self.evict(&tenant).await;
        }
    }

    async fn open(&self, tenant: &TenantId) -> Result<DbPool, QueueError> {
        let record = self
            .catalog
            .get_tenant(tenant)
            .await?
            .ok_or_else(|| QueueError::TenantNotFound(tenant.clone()))?;

        let mut config = self.base.with_url(record.connection.url);
        if let Some(max) = record.connection.max_connections {
            config = config.with_max_connections(max);
        }
        let pool = create_pool(&config)
            .await
            .map_err(|err| QueueError::Connection(format!("tenant {tenant}: {err}")))?;

        info!(
            tenant = %tenant,
            database_url = %sanitize_database_url(&config.url),
            max_connections = config.max_connections,
            "tenant pool opened"
        );
        Ok(pool)
    }
}

#[async_trait]
impl ConnectionResolver for PoolResolver {
    type Connection = DbPool;

    async fn resolve(&self, tenant: &TenantId) -> Result<DbPool, QueueError> {
        let cached = self.pools.get(tenant).map(|entry| entry.value().clone());
        if let Some(pool) = cached {
            return Ok(pool);
        }

        let pool = self.open(tenant).await?;
        // Two workers may open the same tenant at once; the first insert wins.
        let winner = self.pools.entry(tenant.clone()).or_insert(pool).value().clone();
        Ok(winner)
    }

    async fn resolve_default(&self) -> Result<DbPool, QueueError> {
        Ok(self.default_pool.clone())
    }
}
