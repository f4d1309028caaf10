//! Sumi-Harvest main entry point
//!
//! This is the command-line interface for the Sumi-Harvest batch URL harvester.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use sumi_harvest::config::{load_config_with_hash, Config};
use sumi_harvest::crawler::{HttpFetcher, ScrapeOrchestrator, ScrapeReport};
use sumi_harvest::pool::{SqliteManager, SqlitePool};
use sumi_harvest::resilience::{CircuitBreaker, RetryExecutor, RetryPolicy};
use sumi_harvest::shutdown::ShutdownCoordinator;
use sumi_harvest::state::ProgressStore;
use sumi_harvest::storage::{RunStore, SqliteLedger};
use sumi_harvest::HarvestError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Sumi-Harvest: a fault-tolerant batch URL harvester
///
/// Sumi-Harvest fetches every URL in its configuration, backing off on
/// transient failures and failing fast once the remote side is down. Progress
/// is saved after every URL, so an interrupted batch resumes where it stopped.
#[derive(Parser, Debug)]
#[command(name = "sumi-harvest")]
#[command(version)]
#[command(about = "A fault-tolerant batch URL harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Start a fresh batch, discarding saved progress
    #[arg(long)]
    fresh: bool,

    /// Progress snapshot file (overrides the configuration)
    #[arg(long, value_name = "PATH")]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let state_path = cli
        .state
        .clone()
        .or_else(|| config.progress.state_path.as_ref().map(PathBuf::from))
        .unwrap_or_else(ProgressStore::default_path);

    handle_harvest(config, config_hash, state_path, cli.fresh).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_harvest=info,warn"),
            1 => EnvFilter::new("sumi_harvest=debug,info"),
            2 => EnvFilter::new("sumi_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Opens the run ledger; the batch still runs when the database is unusable
fn open_ledger(pool: &Arc<SqlitePool>) -> Option<Arc<dyn RunStore>> {
    match SqliteLedger::new(pool.clone()) {
        Ok(ledger) => Some(Arc::new(ledger)),
        Err(e) => {
            tracing::warn!(database = %pool.target(), error = %e, "run ledger unavailable");
            None
        }
    }
}

/// Handles the main harvest operation
async fn handle_harvest(
    config: Config,
    config_hash: String,
    state_path: PathBuf,
    fresh: bool,
) -> anyhow::Result<ExitCode> {
    let pool = Arc::new(
        SqliteManager::new(Path::new(&config.database.path))
            .into_pool(config.database.max_connections as usize),
    );

    let fetcher = HttpFetcher::new(&config.fetch).context("failed to build HTTP client")?;
    let breaker = Arc::new(CircuitBreaker::from_config(&config.breaker));
    let retry = RetryExecutor::new(RetryPolicy::from(&config.retry));
    let token = CancellationToken::new();

    let mut orchestrator = ScrapeOrchestrator::new(
        fetcher,
        breaker,
        retry,
        ProgressStore::new(&state_path),
    )
    .with_shutdown(token.clone());
    if let Some(ledger) = open_ledger(&pool) {
        orchestrator = orchestrator.with_ledger(ledger, config_hash);
    }

    if fresh {
        orchestrator.fresh().context("failed to discard saved progress")?;
    } else {
        tracing::info!("Resuming from {}", state_path.display());
        orchestrator.resume().context("failed to load saved progress")?;
    }

    ProgressStore::register_for_crash_save(orchestrator.state_saver());
    let mut coordinator = ShutdownCoordinator::install(token, orchestrator.state_saver())
        .context("failed to install signal handlers")?;

    tracing::info!("URLs in configuration: {}", config.urls.len());
    let result = orchestrator.run(&config.urls).await;

    coordinator.restore_handlers();
    pool.close();

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(HarvestError::CircuitOpen(e)) => {
            tracing::error!("Harvest aborted: {}", e);
            eprintln!("Harvest aborted: {}", e);
            eprintln!("Progress saved to {}; rerun to resume.", state_path.display());
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e).context("harvest failed"),
    }
}

fn print_report(report: &ScrapeReport) {
    println!("=== Sumi-Harvest Report ===\n");
    println!(
        "Completed: {}/{}",
        report.completed_count, report.total_count
    );
    println!("Fetched this run: {}", report.results.len());
    println!(
        "Circuit: {} ({} recent failures)",
        report.circuit_state, report.failure_count
    );

    if report.interrupted {
        println!("\nInterrupted: remaining URLs were left pending.");
    }

    if !report.failed.is_empty() {
        println!("\nFailed URLs ({}):", report.failed.len());
        for failed in &report.failed {
            println!("  - {}: {}", failed.url, failed.error);
        }
    }
}
