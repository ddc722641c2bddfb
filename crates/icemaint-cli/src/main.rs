//! icemaint CLI - table maintenance for snapshot-versioned columnar tables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use icemaint_core::config::LogFormat;
use icemaint_core::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, bad override)
    ConfigError = 1,
    /// Unknown procedure or invalid parameters
    ProcedureError = 2,
    /// Invalid filter, sort key or target
    PlanningError = 3,
    /// Catalog error (missing table, rejected commit)
    CatalogError = 4,
    /// Storage error
    StorageError = 5,
    /// Commit retries exhausted
    Aborted = 6,
    /// Memory limit exceeded
    MemoryError = 7,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by its engine error variant.
    fn from_error(error: &anyhow::Error) -> Self {
        use icemaint_core::Error;

        match error.downcast_ref::<Error>() {
            Some(Error::Config(_)) | Some(Error::Serialization(_)) => ExitCode::ConfigError,
            Some(Error::Procedure(_)) => ExitCode::ProcedureError,
            Some(Error::Planning(_)) => ExitCode::PlanningError,
            Some(Error::Catalog(_)) => ExitCode::CatalogError,
            Some(Error::Storage(_)) | Some(Error::Io(_)) | Some(Error::Codec(_)) => {
                ExitCode::StorageError
            }
            Some(Error::MaintenanceAborted { .. }) => ExitCode::Aborted,
            Some(Error::MemoryLimitExceeded { .. }) => ExitCode::MemoryError,
            Some(Error::Cancelled) => ExitCode::SignalInterrupt,
            None if error.downcast_ref::<serde_json::Error>().is_some() => {
                ExitCode::ProcedureError
            }
            None if error.downcast_ref::<toml::de::Error>().is_some() => ExitCode::ConfigError,
            None => ExitCode::RuntimeError,
        }
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "icemaint")]
#[command(about = "Compaction, snapshot expiry and orphan cleanup for warehouse tables", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the warehouse directory
    #[arg(long, global = true, env = "ICEMAINT_WAREHOUSE")]
    warehouse: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print Prometheus metrics to stderr after the command
    #[arg(long, global = true)]
    metrics: bool,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge small data files into target-sized files
    Compact {
        /// Table as namespace.name
        table: String,

        #[command(flatten)]
        options: commands::maintenance::CompactArgs,
    },

    /// Merge small data files and sort their rows
    SortCompact {
        /// Table as namespace.name
        table: String,

        /// Sort key, e.g. "ts DESC NULLS LAST" (repeatable, most significant first)
        #[arg(long = "sort-key", required = true)]
        sort_keys: Vec<String>,

        #[command(flatten)]
        options: commands::maintenance::CompactArgs,
    },

    /// Expire snapshots outside the retention policy
    ExpireSnapshots {
        /// Table as namespace.name
        table: String,

        /// Keep snapshots younger than this many days
        #[arg(long)]
        max_age_days: Option<u64>,

        /// Always keep this many of the most recent snapshots
        #[arg(long)]
        min_retain: Option<u64>,

        /// Report without committing or deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete data files no snapshot references
    RemoveOrphans {
        /// Table as namespace.name
        table: String,

        /// Keep unreferenced files younger than this many days
        #[arg(long)]
        grace_days: Option<u64>,

        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Invoke a named procedure with JSON parameters
    Call {
        /// Procedure name
        name: String,

        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Peek at the config for log settings; a broken file is reported later
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_directive()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config)?;
    if let Some(warehouse) = cli.warehouse {
        config.storage.warehouse_path = warehouse;
    }
    config.validate()?;

    let out = commands::maintenance::Output {
        json: cli.json,
        metrics: cli.metrics,
    };
    match cli.command {
        Commands::Validate => {
            println!("Configuration is valid");
            println!("  Warehouse: {}", config.storage.warehouse_path.display());
        }

        Commands::Compact { table, options } => {
            commands::maintenance::compact(config, &table, options, out).await?;
        }

        Commands::SortCompact {
            table,
            sort_keys,
            options,
        } => {
            commands::maintenance::sort_compact(config, &table, sort_keys, options, out).await?;
        }

        Commands::ExpireSnapshots {
            table,
            max_age_days,
            min_retain,
            dry_run,
        } => {
            commands::maintenance::expire_snapshots(
                config,
                &table,
                max_age_days,
                min_retain,
                dry_run,
                out,
            )
            .await?;
        }

        Commands::RemoveOrphans {
            table,
            grace_days,
            dry_run,
        } => {
            commands::maintenance::remove_orphans(config, &table, grace_days, dry_run, out)
                .await?;
        }

        Commands::Call { name, params } => {
            let params: serde_json::Value = serde_json::from_str(&params)?;
            commands::maintenance::call(config, &name, params, out).await?;
        }
    }

    Ok(())
}

/// Load the configuration file, falling back to `icemaint.toml` in the
/// working directory and then to defaults.
fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None => {
            let fallback = PathBuf::from("icemaint.toml");
            if fallback.is_file() {
                Ok(Config::from_file(&fallback)?)
            } else {
                Ok(Config::default())
            }
        }
    }
}
