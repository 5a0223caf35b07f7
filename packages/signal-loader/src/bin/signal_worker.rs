//! Signal loader worker
//!
//! `signal-worker run` starts one scheduler replica. The other subcommands are
//! one-shot admin operations against the same coordination database; they
//! print JSON to stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use signal_loader::{
    HolderIdentity, JobDefinition, JobStore, PgSourceRegistry, PostgresSignalSink, PostgresStore,
    Scheduler, SharedSettings, WorkerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "signal-worker")]
#[command(about = "Distributed incremental signal loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until interrupted (default)
    Run,

    /// Run a single tick and exit
    Tick,

    /// Show jobs, effective status and active leases
    Status,

    /// Execution history for a job, newest first
    History {
        code: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Create or update a job from a JSON definition file
    UpsertJob { path: PathBuf },

    /// Resume scheduling a job
    Enable { code: String },

    /// Stop scheduling a job (reported as PAUSED)
    Disable { code: String },

    /// Reset every FAILED job to IDLE now
    Recover,

    /// Release stale leases now
    CleanupLeases,
}

#[derive(Serialize)]
struct Response<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn output<T: Serialize>(data: T) -> Result<()> {
    let resp = Response {
        success: true,
        data: Some(data),
    };
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,signal_loader=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env().context("Failed to load configuration")?;

    let store = PostgresStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to coordination database")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(config, store).await,
        Commands::Tick => output(build_scheduler(config, store).tick().await?),
        Commands::Status => output(build_scheduler(config, store).snapshot().await?),
        Commands::History { code, limit } => {
            output(build_scheduler(config, store).recent_executions(&code, limit).await?)
        }
        Commands::UpsertJob { path } => cmd_upsert_job(&store, &path).await,
        Commands::Enable { code } => {
            store.set_enabled(&code, true).await?;
            output(code)
        }
        Commands::Disable { code } => {
            store.set_enabled(&code, false).await?;
            output(code)
        }
        Commands::Recover => output(build_scheduler(config, store).force_recovery().await?),
        Commands::CleanupLeases => output(build_scheduler(config, store).force_lease_cleanup().await),
    }
}

fn build_scheduler(config: WorkerConfig, store: PostgresStore) -> Scheduler {
    let sink = PostgresSignalSink::new(store.pool().clone());
    let sources = PgSourceRegistry::new(config.sources);
    let holder = HolderIdentity::from_env(config.holder_id.as_deref());

    Scheduler::new(
        Arc::new(store),
        Arc::new(sink),
        Arc::new(sources),
        Arc::new(SharedSettings::new(config.settings.clamped())),
        holder,
    )
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_run(config: WorkerConfig, store: PostgresStore) -> Result<()> {
    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Migrations complete");

    let source_count = config.sources.len();
    let scheduler = build_scheduler(config, store);
    tracing::info!(holder = %scheduler.holder(), sources = source_count, "Starting signal worker");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received, finishing in-flight runs"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    scheduler.run(shutdown).await;
    Ok(())
}

async fn cmd_upsert_job(store: &PostgresStore, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definition: JobDefinition =
        serde_json::from_str(&raw).context("Invalid job definition JSON")?;

    let job = store.upsert_job(definition).await?;
    output(job)
}
