use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "tenantq", version, about = "Tenant-aware job queue worker")]
pub struct Cli {
    /// Path to configuration file (overrides TENANTQ_CONFIG_PATH)
    #[arg(short = 'c', long = "config-path", global = true)]
    pub config_path: Option<PathBuf>,

    /// Queue connection to operate on (defaults to worker.connection)
    #[arg(long, global = true)]
    pub connection: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run workers until interrupted
    Work(WorkArgs),

    /// Push a job onto a queue
    Enqueue(EnqueueArgs),

    /// Number of jobs waiting or leased on a queue
    Size {
        #[arg(long, default_value = "default")]
        queue: String,
    },

    /// Delete every job on a queue
    Clear {
        #[arg(long)]
        queue: String,
    },

    /// List dead-lettered jobs, newest first
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Move a dead-lettered job back onto its queue
    Retry { id: i64 },

    /// Delete a dead-lettered job
    Forget { id: i64 },

    /// Delete every dead-lettered job
    Flush,

    /// Manage the tenant catalog table
    #[command(subcommand)]
    Tenants(TenantCommand),
}

#[derive(Debug, Args)]
pub struct WorkArgs {
    /// Queues to poll, highest priority first (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,

    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    #[arg(long, default_value = "default")]
    pub queue: String,

    #[arg(long = "type")]
    pub job_type: String,

    /// JSON arguments, e.g. '{"invoice":7}'
    #[arg(long, default_value = "null")]
    pub args: String,

    /// Tenant the job runs for; omitted means the default connection
    #[arg(long)]
    pub tenant: Option<String>,

    #[arg(long)]
    pub delay_secs: Option<u64>,

    #[arg(long)]
    pub max_attempts: Option<u32>,

    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum TenantCommand {
    List,
    Add {
        id: String,
        database_url: String,
        #[arg(long)]
        max_connections: Option<u32>,
    },
    Remove {
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_accepts_queue_list() {
        let cli = Cli::try_parse_from([
            "tenantq",
            "-c",
            "tenantq.toml",
            "work",
            "--queues",
            "high,default",
            "--concurrency",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.config_path, Some(PathBuf::from("tenantq.toml")));
        match cli.command {
            Command::Work(args) => {
                assert_eq!(args.queues, vec!["high", "default"]);
                assert_eq!(args.concurrency, Some(2));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn enqueue_defaults() {
        let cli = Cli::try_parse_from(["tenantq", "enqueue", "--type", "tenant.ping"]).unwrap();
        match cli.command {
            Command::Enqueue(args) => {
                assert_eq!(args.queue, "default");
                assert_eq!(args.job_type, "tenant.ping");
                assert_eq!(args.args, "null");
                assert!(args.tenant.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["tenantq", "retry", "17", "--connection", "billing"]).unwrap();
        assert_eq!(cli.connection.as_deref(), Some("billing"));
        assert!(matches!(cli.command, Command::Retry { id: 17 }));
    }

    #[test]
    fn clear_requires_a_queue() {
        assert!(Cli::try_parse_from(["tenantq", "clear"]).is_err());
    }
}
