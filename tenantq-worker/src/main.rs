//! tenantq worker
//!
//! Loads configuration, migrates the default database, and either runs the
//! dispatcher until interrupted or performs one maintenance command against a
//! queue connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::SecondsFormat;
use clap::Parser;
use tenantq_config::Config;
use tenantq_db::{
    create_pool, run_migrations, sanitize_database_url, DbPool, PingHandler, PoolResolver,
    SqlTenantCatalog,
};
use tenantq_job_queue::{
    Enqueuer, HandlerRegistry, JobStore, QueueConnection, TaskDescriptor, TenantCatalog,
    TenantId, TenantRecord, Worker,
};
use tokio_util::sync::CancellationToken;

mod cli;
mod tracing_setup;
mod wiring;

use cli::{Cli, Command, EnqueueArgs, TenantCommand, WorkArgs};
use tracing_setup::install_tracing_from_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Resolve config path: CLI > environment variable
    let config_path = cli
        .config_path
        .clone()
        .or_else(|| std::env::var("TENANTQ_CONFIG_PATH").ok().map(PathBuf::from));
    let config = load_config(config_path.as_ref())?;

    install_tracing_from_config(&config.logging)?;

    let db_cfg = wiring::database_config(&config);
    let pool = create_pool(&db_cfg)
        .await
        .context("failed to create database pool")?;
    if let Err(e) = run_migrations(&pool).await {
        tracing::error!(%e, "failed to apply database migrations");
        return Err(anyhow::anyhow!("failed to apply database migrations: {e}"));
    }
    tracing::info!(
        db_url = %sanitize_database_url(&db_cfg.url),
        db_max_connections = db_cfg.max_connections,
        "database ready"
    );

    let manager = wiring::build_manager(&config, pool.clone()).await;
    let connection_name = cli
        .connection
        .clone()
        .unwrap_or_else(|| config.worker.connection.clone());
    let connection = manager
        .connection(&connection_name)
        .await
        .with_context(|| format!("queue connection {connection_name}"))?;
    let store = Arc::clone(&connection.store);

    match cli.command {
        Command::Work(args) => work(&config, connection, pool, args).await?,
        Command::Enqueue(args) => enqueue(connection, args).await?,
        Command::Size { queue } => {
            println!("{}", store.size(&queue).await?);
        }
        Command::Clear { queue } => {
            let deleted = store.clear(&queue).await?;
            tracing::info!(queue = %queue, deleted, "queue cleared");
            println!("{deleted}");
        }
        Command::Failed { limit } => {
            for job in store.failed(limit).await? {
                let job_type = TaskDescriptor::from_payload(&job.payload)
                    .map(|task| task.job_type)
                    .unwrap_or_else(|_| "<undecodable>".to_owned());
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    job.id,
                    job.queue,
                    job_type,
                    job.tenant_id.as_ref().map(TenantId::as_str).unwrap_or("-"),
                    job.attempts,
                    job.failed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    job.last_error,
                );
            }
        }
        Command::Retry { id } => {
            let new_id = store.retry_failed(id).await?;
            tracing::info!(failed_id = id, job_id = new_id, "failed job queued again");
            println!("{new_id}");
        }
        Command::Forget { id } => {
            if !store.forget_failed(id).await? {
                anyhow::bail!("no failed job with id {id}");
            }
        }
        Command::Flush => {
            let deleted = store.flush_failed().await?;
            tracing::info!(deleted, "failed jobs flushed");
            println!("{deleted}");
        }
        Command::Tenants(command) => tenants(SqlTenantCatalog::new(pool), command).await?,
    }

    Ok(())
}

/// Load and validate configuration from file or defaults.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = tenantq_config::load_config(path).map_err(|e| {
        eprintln!("failed to load configuration: {e}");
        anyhow::anyhow!(e.to_string())
    })?;
    tenantq_config::validate_config(&config).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(config)
}

async fn work(
    config: &Config,
    connection: QueueConnection,
    pool: DbPool,
    args: WorkArgs,
) -> anyhow::Result<()> {
    let catalog: Arc<dyn TenantCatalog> = match config.tenants.catalog.as_str() {
        "static" => Arc::new(wiring::static_catalog(config)),
        _ => Arc::new(SqlTenantCatalog::new(pool.clone())),
    };
    let resolver = Arc::new(PoolResolver::new(
        catalog,
        pool,
        wiring::tenant_pool_config(config),
    ));

    let handlers = HandlerRegistry::<DbPool>::new();
    handlers.register(PingHandler).await;

    let mut options = wiring::worker_options(config, &connection.config);
    if !args.queues.is_empty() {
        options = options.with_queues(args.queues);
    }
    let concurrency = args.concurrency.unwrap_or(config.worker.concurrency).max(1);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(%e, "failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    tracing::info!(
        connection = %connection.name,
        driver = %connection.config.driver,
        queues = ?options.queues,
        concurrency,
        job_types = ?handlers.job_types().await,
        "starting workers"
    );
    let worker = Worker::new(connection.store, Arc::clone(&resolver), handlers, options);
    worker.run_pool(concurrency, shutdown).await;

    resolver.close_all().await;
    tracing::info!("workers stopped");
    Ok(())
}

async fn enqueue(connection: QueueConnection, args: EnqueueArgs) -> anyhow::Result<()> {
    let job_args: serde_json::Value =
        serde_json::from_str(&args.args).context("invalid JSON arguments")?;
    let mut task = TaskDescriptor::new(args.job_type, job_args);
    if let Some(max_attempts) = args.max_attempts {
        task = task.with_max_attempts(max_attempts);
    }
    if let Some(secs) = args.timeout_secs {
        task = task.with_timeout(Duration::from_secs(secs));
    }

    let tenant = args.tenant.map(TenantId::new);
    let delay = args.delay_secs.map(Duration::from_secs);
    let id = Enqueuer::new(connection.store)
        .push(&args.queue, &task, &tenant, delay)
        .await?;
    println!("{id}");
    Ok(())
}

async fn tenants(catalog: SqlTenantCatalog, command: TenantCommand) -> anyhow::Result<()> {
    match command {
        TenantCommand::List => {
            for tenant in catalog.list_tenants().await? {
                let max = tenant
                    .connection
                    .max_connections
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_owned());
                println!(
                    "{}\t{}\t{}",
                    tenant.id,
                    sanitize_database_url(&tenant.connection.url),
                    max
                );
            }
        }
        TenantCommand::Add {
            id,
            database_url,
            max_connections,
        } => {
            let mut record = TenantRecord::new(id, database_url);
            record.connection.max_connections = max_connections;
            catalog.upsert_tenant(&record).await?;
            tracing::info!(tenant = %record.id, "tenant saved");
        }
        TenantCommand::Remove { id } => {
            if !catalog.remove_tenant(&TenantId::new(id.clone())).await? {
                anyhow::bail!("no tenant with id {id}");
            }
        }
    }
    Ok(())
}
