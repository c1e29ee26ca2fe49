//! Turns a loaded [`Config`] into queue, pool and worker settings.

use std::sync::Arc;
use std::time::Duration;

use tenantq_config::{BackoffConfig, Config, ConnectionConfig};
use tenantq_db::{DatabaseConnector, DbConnectionConfig, DbPool, DATABASE_DRIVER};
use tenantq_job_queue::{
    BackoffPolicy, QueueConnectionConfig, QueueManager, StaticTenantCatalog, TenantRecord,
    WorkerOptions,
};

/// Pool settings for the default database.
pub fn database_config(cfg: &Config) -> DbConnectionConfig {
    DbConnectionConfig {
        url: cfg.database.url.clone(),
        max_connections: cfg.database.max_connections,
        min_connections: cfg.database.min_connections,
        connect_timeout_secs: cfg.database.connect_timeout_secs,
        idle_timeout_secs: cfg.database.idle_timeout_secs,
        ..DbConnectionConfig::default()
    }
}

/// Pool settings every tenant pool starts from; the url comes from the catalog.
pub fn tenant_pool_config(cfg: &Config) -> DbConnectionConfig {
    DbConnectionConfig {
        connect_timeout_secs: cfg.database.connect_timeout_secs,
        idle_timeout_secs: cfg.database.idle_timeout_secs,
        ..DbConnectionConfig::default()
    }
    .with_max_connections(cfg.tenants.max_connections)
}

pub fn backoff_policy(cfg: &BackoffConfig) -> BackoffPolicy {
    match cfg.strategy.as_str() {
        "fixed" => BackoffPolicy::fixed(Duration::from_millis(cfg.delay_ms)),
        _ => BackoffPolicy::exponential(
            Duration::from_millis(cfg.base_ms),
            Duration::from_millis(cfg.max_ms),
        )
        .with_jitter(cfg.jitter),
    }
}

pub fn queue_connection(cfg: &ConnectionConfig) -> QueueConnectionConfig {
    QueueConnectionConfig {
        driver: cfg.driver.clone(),
        table: cfg.table.clone(),
        failed_table: cfg.failed_table.clone(),
        lease: Duration::from_secs(cfg.lease_secs),
        backoff: backoff_policy(&cfg.backoff),
        max_attempts: cfg.max_attempts,
    }
}

/// Worker loop settings: queue behaviour from the connection, polling from `worker`.
pub fn worker_options(cfg: &Config, connection: &QueueConnectionConfig) -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(cfg.worker.poll_interval_ms),
        max_poll_backoff: Duration::from_millis(cfg.worker.max_poll_backoff_ms),
        timeout: Duration::from_secs(cfg.worker.timeout_secs),
        ..WorkerOptions::from_connection(connection)
    }
    .with_queues(cfg.worker.queues.iter().cloned())
}

pub fn static_catalog(cfg: &Config) -> StaticTenantCatalog {
    cfg.tenants
        .entries
        .iter()
        .map(|entry| {
            let mut record = TenantRecord::new(entry.id.as_str(), entry.url.as_str());
            record.connection.max_connections = entry.max_connections;
            record
        })
        .collect()
}

/// A manager with the `database` driver bound to `pool` and every configured connection added.
pub async fn build_manager(cfg: &Config, pool: DbPool) -> QueueManager {
    let manager = QueueManager::new();
    manager
        .register_connector(DATABASE_DRIVER, Arc::new(DatabaseConnector::new(pool)))
        .await;
    for (name, connection) in &cfg.connections {
        manager
            .add_connection(name.as_str(), queue_connection(connection))
            .await;
    }
    manager
}
