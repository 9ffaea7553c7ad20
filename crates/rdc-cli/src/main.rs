use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rdc_core::OutcomeSummary;
use rdc_storage::DedupStore;
use rdc_sync::{
    build_collection_job, latest_run_summary, CollectorConfig, CollectorEnv, Scheduler,
    SchedulerOptions,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rdc-cli")]
#[command(about = "Resilient data collector")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Perform a single collection run.
    Run,
    /// Run on the configured schedule until Ctrl-C.
    Schedule,
    /// Print the summary of the most recent run.
    Summary,
    /// Forget every content fingerprint.
    ResetDedup,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_summary(label: &str, summary: &OutcomeSummary) {
    println!(
        "{label}: valid={} duplicate={} invalid={} failed={} cancelled={}",
        summary.valid, summary.duplicate, summary.invalid, summary.failed, summary.cancelled
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);
    let env = CollectorEnv::from_env();

    let command = cli.command.unwrap_or(if env.scheduler_enabled {
        Commands::Schedule
    } else {
        Commands::Run
    });

    match command {
        Commands::Run => {
            let summary = rdc_sync::run_once_from_env().await?;
            print_summary("run complete", &summary);
        }
        Commands::Schedule => schedule(&env).await?,
        Commands::Summary => match latest_run_summary(&env.reports_dir)? {
            Some(last) => {
                println!(
                    "run_id={} started_at={} finished_at={} records={}",
                    last.run_id, last.started_at, last.finished_at, last.records
                );
                print_summary("outcomes", &last.summary);
                for failure in &last.failures {
                    println!("failed: {} ({})", failure.url, failure.reason);
                }
            }
            None => println!("no runs recorded under {}", env.reports_dir.display()),
        },
        Commands::ResetDedup => {
            let config = CollectorConfig::load(&env.config_path)?;
            let path = env.dedup_path();
            let mut store = DedupStore::load(&path, config.settings.dedup_capacity)
                .await
                .with_context(|| format!("loading dedup state {}", path.display()))?;
            let forgotten = store.len();
            store.reset();
            store.persist(&path).await?;
            println!("dedup reset: forgot {forgotten} fingerprints");
        }
    }

    Ok(())
}

async fn schedule(env: &CollectorEnv) -> Result<()> {
    let config = CollectorConfig::load(&env.config_path)?;
    let job = Arc::new(build_collection_job(env, &config).await?);
    let options = SchedulerOptions::from_settings(&config.settings);
    info!(tick = ?options.tick, min_gap = ?options.min_gap, "scheduler starting");
    let handle = Scheduler::spawn(options, job).await?;

    wait_for_stop(&handle).await?;

    info!("stop requested; waiting for in-flight run");
    let status = handle.stop().await?;
    println!(
        "scheduler stopped: completed_runs={} missed_ticks={}",
        status.completed_runs, status.missed_ticks
    );
    if let Some(summary) = &status.last_summary {
        print_summary("last run", summary);
    }
    Ok(())
}

/// Block until Ctrl-C. On unix, SIGUSR1 forces an immediate run.
#[cfg(unix)]
async fn wait_for_stop(handle: &rdc_sync::SchedulerHandle) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut run_now = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.context("waiting for ctrl-c"),
            _ = run_now.recv() => {
                if !handle.run_now().await {
                    warn!("scheduler no longer accepting commands");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop(_handle: &rdc_sync::SchedulerHandle) -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")
}
