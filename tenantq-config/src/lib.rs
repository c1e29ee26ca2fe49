use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;

/// SQL identifiers that may be interpolated as table names.
static TABLE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());

/// Queue names: printable, no whitespace, not starting with punctuation.
static QUEUE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$").unwrap());

const ENV_PREFIX: &str = "TENANTQ";

#[derive(Debug, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub worker: Option<WorkerSection>,
    #[serde(default)]
    pub connections: Option<BTreeMap<String, ConnectionSection>>,
    #[serde(default)]
    pub tenants: Option<TenantsSection>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub queues: Option<Vec<String>>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_poll_backoff_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub failed_table: Option<String>,
    #[serde(default)]
    pub lease_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<BackoffSection>,
}

#[derive(Debug, Deserialize)]
pub struct BackoffSection {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub base_ms: Option<u64>,
    #[serde(default)]
    pub max_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TenantsSection {
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub entries: Option<Vec<TenantEntry>>,
}

/// A statically configured tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEntry {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Load a RawConfigFile from a path. The format is inferred from the extension: .toml, .yaml/.yml, .json
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_config_str(&s, ext.as_deref())
}

/// Parse configuration from a string with optional format hint
#[inline]
fn parse_config_str(s: &str, ext: Option<&str>) -> Result<RawConfigFile, ConfigError> {
    match ext {
        #[cfg(feature = "toml")]
        Some("toml") => toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        #[cfg(feature = "yaml")]
        Some("yaml" | "yml") => {
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        #[cfg(feature = "json")]
        Some("json") => serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        _ => parse_config_auto(s),
    }
}

/// Try to parse config by attempting each enabled format
#[inline]
fn parse_config_auto(s: &str) -> Result<RawConfigFile, ConfigError> {
    #[cfg(feature = "yaml")]
    if let Ok(cfg) = serde_yaml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "toml")]
    if let Ok(cfg) = toml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "json")]
    if let Ok(cfg) = serde_json::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(any(feature = "yaml", feature = "toml", feature = "json"))]
    {
        Err(ConfigError::Parse(
            "failed to parse config as any supported format".into(),
        ))
    }

    #[cfg(not(any(feature = "yaml", feature = "toml", feature = "json")))]
    {
        let _ = s;
        Err(ConfigError::Parse("no config format enabled".into()))
    }
}

/// Concrete worker configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub worker: WorkerConfig,
    /// Named queue connections; `worker.connection` picks one.
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub tenants: TenantsConfig,
}

/// The default (central) database: job tables, tenant catalog, tenant-less jobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerConfig {
    pub connection: String,
    /// Highest priority first.
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_poll_backoff_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionConfig {
    pub driver: String,
    pub table: String,
    pub failed_table: String,
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffConfig {
    /// `fixed` or `exponential`.
    pub strategy: String,
    pub delay_ms: u64,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantsConfig {
    /// `database` reads the `tenants` table; `static` uses `entries`.
    pub catalog: String,
    /// Pool size for each tenant database unless its entry says otherwise.
    pub max_connections: u32,
    pub entries: Vec<TenantEntry>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            driver: "database".to_string(),
            table: "jobs".to_string(),
            failed_table: "failed_jobs".to_string(),
            lease_secs: 90,
            max_attempts: 3,
            backoff: BackoffConfig {
                strategy: "exponential".to_string(),
                delay_ms: 1_000,
                base_ms: 1_000,
                max_ms: 300_000,
                jitter: true,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert("default".to_string(), ConnectionConfig::default());
        Self {
            database: DatabaseConfig {
                url: "sqlite://tenantq.sqlite".to_string(),
                max_connections: 10,
                min_connections: 1,
                connect_timeout_secs: 30,
                idle_timeout_secs: Some(600),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
            worker: WorkerConfig {
                connection: "default".to_string(),
                queues: vec!["default".to_string()],
                concurrency: 4,
                poll_interval_ms: 1_000,
                max_poll_backoff_ms: 60_000,
                timeout_secs: 60,
            },
            connections,
            tenants: TenantsConfig {
                catalog: "database".to_string(),
                max_connections: 5,
                entries: Vec::new(),
            },
        }
    }
}

impl Config {
    /// The connection the worker is bound to.
    pub fn worker_connection(&self) -> Option<&ConnectionConfig> {
        self.connections.get(&self.worker.connection)
    }
}

#[inline]
fn parse_bool(s: &str) -> Result<bool, ()> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(()),
    }
}

#[inline]
fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .filter_map(|p| {
            let trimmed = p.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Helper macro to apply optional value if present
macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
    ($target:expr, $source:expr, wrap) => {
        if let Some(v) = $source {
            $target = Some(v);
        }
    };
}

fn apply_connection(target: &mut ConnectionConfig, section: ConnectionSection) {
    apply_opt!(target.driver, section.driver);
    apply_opt!(target.table, section.table);
    apply_opt!(target.failed_table, section.failed_table);
    apply_opt!(target.lease_secs, section.lease_secs);
    apply_opt!(target.max_attempts, section.max_attempts);
    if let Some(backoff) = section.backoff {
        apply_opt!(target.backoff.strategy, backoff.strategy);
        apply_opt!(target.backoff.delay_ms, backoff.delay_ms);
        apply_opt!(target.backoff.base_ms, backoff.base_ms);
        apply_opt!(target.backoff.max_ms, backoff.max_ms);
        apply_opt!(target.backoff.jitter, backoff.jitter);
    }
}

/// Merge a parsed file over `cfg`. Each named connection starts from the defaults.
pub fn apply_raw(cfg: &mut Config, raw: RawConfigFile) {
    if let Some(db) = raw.database {
        apply_opt!(cfg.database.url, db.url);
        apply_opt!(cfg.database.max_connections, db.max_connections);
        apply_opt!(cfg.database.min_connections, db.min_connections);
        apply_opt!(cfg.database.connect_timeout_secs, db.connect_timeout_secs);
        apply_opt!(cfg.database.idle_timeout_secs, db.idle_timeout_secs, wrap);
    }
    if let Some(logging) = raw.logging {
        apply_opt!(cfg.logging.level, logging.level);
        apply_opt!(cfg.logging.json, logging.json);
    }
    if let Some(worker) = raw.worker {
        apply_opt!(cfg.worker.connection, worker.connection);
        apply_opt!(cfg.worker.queues, worker.queues);
        apply_opt!(cfg.worker.concurrency, worker.concurrency);
        apply_opt!(cfg.worker.poll_interval_ms, worker.poll_interval_ms);
        apply_opt!(cfg.worker.max_poll_backoff_ms, worker.max_poll_backoff_ms);
        apply_opt!(cfg.worker.timeout_secs, worker.timeout_secs);
    }
    if let Some(connections) = raw.connections {
        for (name, section) in connections {
            let target = cfg.connections.entry(name).or_default();
            apply_connection(target, section);
        }
    }
    if let Some(tenants) = raw.tenants {
        apply_opt!(cfg.tenants.catalog, tenants.catalog);
        apply_opt!(cfg.tenants.max_connections, tenants.max_connections);
        apply_opt!(cfg.tenants.entries, tenants.entries);
    }
}

/// Load concrete `Config` from optional file and environment variables.
/// Environment variables take precedence over file values and defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(p) = path {
        let raw = load_raw_from_file(p)?;
        apply_raw(&mut cfg, raw);
    }

    apply_env_overrides(&mut cfg, |key| env::var(key).ok())?;

    Ok(cfg)
}

/// Reads `TENANTQ_<suffix>` through `lookup`.
struct EnvSource<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn key(suffix: &str) -> String {
        format!("{ENV_PREFIX}_{suffix}")
    }

    fn str(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&Self::key(suffix))
    }

    fn parse<T: std::str::FromStr>(&self, suffix: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.str(suffix) {
            Some(v) => v.trim().parse::<T>().map(Some).map_err(|e| {
                ConfigError::Parse(format!("invalid {}: {}", Self::key(suffix), e))
            }),
            None => Ok(None),
        }
    }

    fn bool(&self, suffix: &str) -> Result<Option<bool>, ConfigError> {
        match self.str(suffix) {
            Some(v) => parse_bool(&v)
                .map(Some)
                .map_err(|_| ConfigError::Parse(format!("invalid {}", Self::key(suffix)))),
            None => Ok(None),
        }
    }
}

/// Apply `TENANTQ_*` overrides. Queue overrides target the worker's connection.
pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvSource { lookup };

    // Database
    if let Some(v) = env.str("DATABASE_URL") {
        cfg.database.url = v;
    }
    if let Some(v) = env.parse::<u32>("DB_MAX_CONNECTIONS")? {
        cfg.database.max_connections = v;
    }
    if let Some(v) = env.parse::<u32>("DB_MIN_CONNECTIONS")? {
        cfg.database.min_connections = v;
    }

    // Logging
    if let Some(v) = env.str("LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env.bool("LOG_JSON")? {
        cfg.logging.json = v;
    }

    // Worker
    if let Some(v) = env.str("WORKER_CONNECTION") {
        cfg.worker.connection = v;
    }
    if let Some(v) = env.str("WORKER_QUEUES") {
        cfg.worker.queues = split_csv(&v);
    }
    if let Some(v) = env.parse::<usize>("WORKER_CONCURRENCY")? {
        cfg.worker.concurrency = v;
    }
    if let Some(v) = env.parse::<u64>("WORKER_POLL_INTERVAL_MS")? {
        cfg.worker.poll_interval_ms = v;
    }
    if let Some(v) = env.parse::<u64>("WORKER_MAX_POLL_BACKOFF_MS")? {
        cfg.worker.max_poll_backoff_ms = v;
    }
    if let Some(v) = env.parse::<u64>("WORKER_TIMEOUT_SECS")? {
        cfg.worker.timeout_secs = v;
    }

    // Queue connection used by the worker
    let lease = env.parse::<u64>("QUEUE_LEASE_SECS")?;
    let max_attempts = env.parse::<u32>("QUEUE_MAX_ATTEMPTS")?;
    let driver = env.str("QUEUE_DRIVER");
    if lease.is_some() || max_attempts.is_some() || driver.is_some() {
        let connection = cfg
            .connections
            .entry(cfg.worker.connection.clone())
            .or_default();
        apply_opt!(connection.lease_secs, lease);
        apply_opt!(connection.max_attempts, max_attempts);
        apply_opt!(connection.driver, driver);
    }

    // Tenants
    if let Some(v) = env.str("TENANT_CATALOG") {
        cfg.tenants.catalog = v;
    }
    if let Some(v) = env.parse::<u32>("TENANT_MAX_CONNECTIONS")? {
        cfg.tenants.max_connections = v;
    }

    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| invalid(format!("invalid {field}: {e}")))
}

fn validate_connection(name: &str, conn: &ConnectionConfig) -> Result<(), ConfigError> {
    match conn.driver.as_str() {
        "database" | "memory" => {}
        other => {
            return Err(invalid(format!(
                "connections.{name}.driver: unsupported queue driver: {other}"
            )))
        }
    }
    for (field, table) in [("table", &conn.table), ("failed_table", &conn.failed_table)] {
        if !TABLE_NAME_REGEX.is_match(table) {
            return Err(invalid(format!(
                "connections.{name}.{field}: invalid table name: {table}"
            )));
        }
    }
    if conn.table == conn.failed_table {
        return Err(invalid(format!(
            "connections.{name}: table and failed_table must differ"
        )));
    }
    if conn.lease_secs == 0 {
        return Err(invalid(format!("connections.{name}.lease_secs must be > 0")));
    }
    if conn.max_attempts == 0 {
        return Err(invalid(format!("connections.{name}.max_attempts must be > 0")));
    }

    let backoff = &conn.backoff;
    match backoff.strategy.as_str() {
        "fixed" => {}
        "exponential" => {
            if backoff.base_ms == 0 {
                return Err(invalid(format!(
                    "connections.{name}.backoff.base_ms must be > 0"
                )));
            }
            if backoff.max_ms < backoff.base_ms {
                return Err(invalid(format!(
                    "connections.{name}.backoff.max_ms must be >= base_ms"
                )));
            }
        }
        other => {
            return Err(invalid(format!(
                "connections.{name}.backoff.strategy: unknown strategy: {other}"
            )))
        }
    }
    Ok(())
}

/// Validate higher-level constraints on the resolved configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    validate_url("database.url", &cfg.database.url)?;
    if cfg.database.max_connections == 0 {
        return Err(invalid("database.max_connections must be > 0"));
    }
    if cfg.database.min_connections > cfg.database.max_connections {
        return Err(invalid(
            "database.min_connections must not exceed database.max_connections",
        ));
    }

    if cfg.logging.level.trim().is_empty() {
        return Err(invalid("logging.level must not be empty"));
    }

    for (name, conn) in &cfg.connections {
        validate_connection(name, conn)?;
    }
    if cfg.worker_connection().is_none() {
        return Err(invalid(format!(
            "worker.connection refers to unknown connection: {}",
            cfg.worker.connection
        )));
    }
    if cfg.worker.queues.is_empty() {
        return Err(invalid("worker.queues must name at least one queue"));
    }
    if let Some(bad) = cfg
        .worker
        .queues
        .iter()
        .find(|q| !QUEUE_NAME_REGEX.is_match(q))
    {
        return Err(invalid(format!("invalid queue name: {bad}")));
    }
    if cfg.worker.concurrency == 0 {
        return Err(invalid("worker.concurrency must be > 0"));
    }
    if cfg.worker.poll_interval_ms == 0 {
        return Err(invalid("worker.poll_interval_ms must be > 0"));
    }
    if cfg.worker.max_poll_backoff_ms < cfg.worker.poll_interval_ms {
        return Err(invalid(
            "worker.max_poll_backoff_ms must be >= worker.poll_interval_ms",
        ));
    }
    if cfg.worker.timeout_secs == 0 {
        return Err(invalid("worker.timeout_secs must be > 0"));
    }
    // A job must settle before its lease can be reclaimed by another worker.
    if let Some((name, conn)) = cfg
        .connections
        .iter()
        .find(|(_, conn)| cfg.worker.timeout_secs >= conn.lease_secs)
    {
        return Err(invalid(format!(
            "worker.timeout_secs ({}) must be below connections.{name}.lease_secs ({})",
            cfg.worker.timeout_secs, conn.lease_secs
        )));
    }

    match cfg.tenants.catalog.as_str() {
        "database" | "static" => {}
        other => return Err(invalid(format!("unknown tenant catalog: {other}"))),
    }
    if cfg.tenants.max_connections == 0 {
        return Err(invalid("tenants.max_connections must be > 0"));
    }
    let mut seen = HashSet::new();
    for entry in &cfg.tenants.entries {
        if entry.id.trim().is_empty() {
            return Err(invalid("tenant ids must not be empty"));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(invalid(format!("duplicate tenant id: {}", entry.id)));
        }
        validate_url(&format!("tenants.entries[{}].url", entry.id), &entry.url)?;
        if entry.max_connections == Some(0) {
            return Err(invalid(format!(
                "tenants.entries[{}].max_connections must be > 0",
                entry.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::Builder;

    fn write_config(ext: &str, contents: &str) -> tempfile::NamedTempFile {
        let f = Builder::new().suffix(ext).tempfile().expect("tmpfile");
        std::fs::write(f.path(), contents).unwrap();
        f
    }

    fn from_file(ext: &str, contents: &str) -> Config {
        let f = write_config(ext, contents);
        let mut cfg = Config::default();
        apply_raw(&mut cfg, load_raw_from_file(f.path()).expect("load"));
        cfg
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        validate_config(&cfg).unwrap();
        let conn = cfg.worker_connection().unwrap();
        assert_eq!(conn.max_attempts, 3);
        assert_eq!(conn.lease_secs, 90);
        assert_eq!(conn.backoff.strategy, "exponential");
        assert!(conn.backoff.jitter);
    }

    #[test]
    fn parse_toml() {
        let cfg = from_file(
            ".toml",
            r#"
[database]
url = "postgres://queue@db/central"

[worker]
connection = "billing"
queues = ["invoices", "default"]
concurrency = 8

[connections.billing]
table = "billing_jobs"
failed_table = "billing_failed_jobs"
max_attempts = 5

[connections.billing.backoff]
strategy = "fixed"
delay_ms = 2500

[tenants]
catalog = "static"

[[tenants.entries]]
id = "acme"
url = "postgres://acme@db/acme"
max_connections = 2
"#,
        );
        assert_eq!(cfg.database.url, "postgres://queue@db/central");
        assert_eq!(cfg.worker.queues, vec!["invoices", "default"]);
        assert_eq!(cfg.worker.concurrency, 8);

        let billing = cfg.worker_connection().unwrap();
        assert_eq!(billing.table, "billing_jobs");
        assert_eq!(billing.max_attempts, 5);
        assert_eq!(billing.lease_secs, 90);
        assert_eq!(billing.backoff.strategy, "fixed");
        assert_eq!(billing.backoff.delay_ms, 2500);
        assert!(cfg.connections.contains_key("default"));

        assert_eq!(cfg.tenants.catalog, "static");
        assert_eq!(cfg.tenants.entries[0].max_connections, Some(2));
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn parse_yaml_and_json() {
        let yaml = from_file(
            ".yml",
            r#"
logging:
  level: debug
  json: true
worker:
  poll_interval_ms: 250
"#,
        );
        assert_eq!(yaml.logging.level, "debug");
        assert!(yaml.logging.json);
        assert_eq!(yaml.worker.poll_interval_ms, 250);

        let json = from_file(
            ".json",
            r#"{"connections": {"default": {"lease_secs": 15, "backoff": {"jitter": false}}}}"#,
        );
        let conn = json.worker_connection().unwrap();
        assert_eq!(conn.lease_secs, 15);
        assert!(!conn.backoff.jitter);
        assert_eq!(conn.backoff.base_ms, 1_000);
    }

    #[test]
    fn unknown_extension_falls_back_to_detection() {
        let cfg = from_file(".conf", "worker:\n  concurrency: 2\n");
        assert_eq!(cfg.worker.concurrency, 2);
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TENANTQ_DATABASE_URL", "sqlite://override.db"),
            ("TENANTQ_LOG_LEVEL", "warn"),
            ("TENANTQ_LOG_JSON", "yes"),
            ("TENANTQ_WORKER_QUEUES", "high, default, ,low"),
            ("TENANTQ_WORKER_CONCURRENCY", "16"),
            ("TENANTQ_QUEUE_MAX_ATTEMPTS", "7"),
            ("TENANTQ_TENANT_CATALOG", "static"),
        ]);
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg, |key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.database.url, "sqlite://override.db");
        assert_eq!(cfg.logging.level, "warn");
        assert!(cfg.logging.json);
        assert_eq!(cfg.worker.queues, vec!["high", "default", "low"]);
        assert_eq!(cfg.worker.concurrency, 16);
        assert_eq!(cfg.worker_connection().unwrap().max_attempts, 7);
        assert_eq!(cfg.tenants.catalog, "static");
    }

    #[test]
    fn env_override_parse_errors() {
        let mut cfg = Config::default();
        let err = apply_env_overrides(&mut cfg, |key| {
            (key == "TENANTQ_WORKER_CONCURRENCY").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("TENANTQ_WORKER_CONCURRENCY"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.worker.connection = "missing".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.connections.get_mut("default").unwrap().table = "jobs; drop".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.connections.get_mut("default").unwrap().driver = "redis".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.worker.queues = vec!["has space".into()];
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.worker.max_poll_backoff_ms = 10;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.worker.timeout_secs = 90;
        let err = validate_config(&cfg).unwrap_err().to_string();
        assert!(err.contains("connections.default.lease_secs"), "{err}");
        cfg.worker.timeout_secs = 89;
        validate_config(&cfg).unwrap();

        let mut cfg = Config::default();
        cfg.tenants.entries = vec![
            TenantEntry {
                id: "a".into(),
                url: "sqlite://a.db".into(),
                max_connections: None,
            },
            TenantEntry {
                id: "a".into(),
                url: "sqlite://b.db".into(),
                max_connections: None,
            },
        ];
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn csv_split() {
        let parts = split_csv("a, b, , c");
        assert_eq!(parts, vec!["a", "b", "c"]);
    }
}
