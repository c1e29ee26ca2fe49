//! Tenant catalog kept in a database table.

use async_trait::async_trait;
use tenantq_job_queue::{ConnectionParams, QueueError, TenantCatalog, TenantId, TenantRecord};

use crate::queries::{self, TenantRow};
use crate::store::validate_identifier;
use crate::DbPool;

/// [`TenantCatalog`] backed by the `tenants` table of the default database.
#[derive(Debug, Clone)]
pub struct SqlTenantCatalog {
    pool: DbPool,
    table: String,
}

impl SqlTenantCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            table: "tenants".to_owned(),
        }
    }

    pub fn with_table(pool: DbPool, table: impl Into<String>) -> Result<Self, QueueError> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { pool, table })
    }

    /// Insert or replace a tenant's connection parameters.
    pub async fn upsert_tenant(&self, record: &TenantRecord) -> Result<(), QueueError> {
        let row = TenantRow {
            id: record.id.as_str().to_owned(),
            database_url: record.connection.url.clone(),
            max_connections: record.connection.max_connections.map(i64::from),
        };
        queries::tenants::upsert(&self.pool, &self.table, &row)
            .await
            .map_err(catalog_error)
    }

    pub async fn remove_tenant(&self, id: &TenantId) -> Result<bool, QueueError> {
        let deleted = queries::tenants::delete(&self.pool, &self.table, id.as_str())
            .await
            .map_err(catalog_error)?;
        Ok(deleted > 0)
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantRecord>, QueueError> {
        queries::tenants::list(&self.pool, &self.table)
            .await
            .map_err(catalog_error)?
            .into_iter()
            .map(TenantRow::into_record)
            .collect()
    }
}

#[async_trait]
impl TenantCatalog for SqlTenantCatalog {
    async fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, QueueError> {
        queries::tenants::find(&self.pool, &self.table, id.as_str())
            .await
            .map_err(catalog_error)?
            .map(TenantRow::into_record)
            .transpose()
    }
}

impl TenantRow {
    pub fn into_record(self) -> Result<TenantRecord, QueueError> {
        let max_connections = self
            .max_connections
            .map(|max| {
                u32::try_from(max).map_err(|_| {
                    QueueError::Connection(format!(
                        "tenant {} has invalid max_connections {max}",
                        self.id
                    ))
                })
            })
            .transpose()?;
        Ok(TenantRecord {
            id: TenantId::new(self.id),
            connection: ConnectionParams {
                url: self.database_url,
                max_connections,
            },
        })
    }
}

// A catalog that cannot be read is a resolution failure, not a queue failure.
fn catalog_error(err: sqlx::Error) -> QueueError {
    QueueError::Connection(format!("tenant catalog: {err}"))
}
