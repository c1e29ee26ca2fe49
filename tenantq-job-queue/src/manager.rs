//! Named queue connections and the drivers that back them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::memory::MemoryJobStore;
use crate::store::JobStore;

pub const MEMORY_DRIVER: &str = "memory";

const DEFAULT_LEASE_SECS: u64 = 90;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Configuration of one queue connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConnectionConfig {
    pub driver: String,
    pub table: String,
    pub failed_table: String,
    /// How long a reservation stays exclusive before another worker may reclaim it.
    pub lease: Duration,
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl Default for QueueConnectionConfig {
    fn default() -> Self {
        Self {
            driver: "database".to_owned(),
            table: "jobs".to_owned(),
            failed_table: "failed_jobs".to_owned(),
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl QueueConnectionConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Self::default()
        }
    }
}

/// Builds a store for a connection config.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &QueueConnectionConfig) -> Result<Arc<dyn JobStore>, QueueError>;
}

/// Connector for the `memory` driver. Every connect yields a fresh, empty store.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    clock: Arc<dyn Clock>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }
}

impl MemoryConnector {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &QueueConnectionConfig) -> Result<Arc<dyn JobStore>, QueueError> {
        Ok(Arc::new(MemoryJobStore::with_clock(Arc::clone(&self.clock))))
    }
}

/// A connected store together with the config it was built from.
#[derive(Clone)]
pub struct QueueConnection {
    pub name: String,
    pub config: QueueConnectionConfig,
    pub store: Arc<dyn JobStore>,
}

impl fmt::Debug for QueueConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConnection")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("store", &"<dyn JobStore>")
            .finish()
    }
}

/// Registry of drivers and named connections. Stores are connected lazily and cached.
pub struct QueueManager {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
    configs: RwLock<HashMap<String, QueueConnectionConfig>>,
    connections: RwLock<HashMap<String, QueueConnection>>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("connectors", &"<RwLock<HashMap<String, Arc<dyn Connector>>>>")
            .field("configs", &"<RwLock<HashMap<String, QueueConnectionConfig>>>")
            .finish()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    /// A manager with only the `memory` driver registered.
    pub fn new() -> Self {
        let mut connectors: HashMap<String, Arc<dyn Connector>> = HashMap::new();
        connectors.insert(MEMORY_DRIVER.to_owned(), Arc::new(MemoryConnector::default()));
        Self {
            connectors: RwLock::new(connectors),
            configs: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_connector(&self, driver: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.write().await.insert(driver.into(), connector);
    }

    /// Add or replace a named connection. A cached store for that name is dropped.
    pub async fn add_connection(&self, name: impl Into<String>, config: QueueConnectionConfig) {
        let name = name.into();
        self.connections.write().await.remove(&name);
        self.configs.write().await.insert(name, config);
    }

    pub async fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The store for connection `name`, connecting it on first use.
    pub async fn connection(&self, name: &str) -> Result<QueueConnection, QueueError> {
        if let Some(connection) = self.connections.read().await.get(name) {
            return Ok(connection.clone());
        }

        // Held across connect so concurrent callers don't connect twice.
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get(name) {
            return Ok(connection.clone());
        }

        let config = self
            .configs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownConnection(name.to_owned()))?;
        let connector = self
            .connectors
            .read()
            .await
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| QueueError::UnsupportedDriver(config.driver.clone()))?;

        let store = connector.connect(&config).await?;
        info!(
            connection = name,
            driver = %config.driver,
            table = %config.table,
            lease_secs = config.lease.as_secs(),
            max_attempts = config.max_attempts,
            "queue connection established"
        );

        let connection = QueueConnection {
            name: name.to_owned(),
            config,
            store,
        };
        connections.insert(name.to_owned(), connection.clone());
        Ok(connection)
    }
}
