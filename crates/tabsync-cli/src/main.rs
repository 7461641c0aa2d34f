use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tabsync_core::format_timestamp;
use tabsync_sync::{
    active_collection, build_pipeline, build_poll_scheduler, build_store, build_trigger_scheduler,
    final_start_time, latest_collection, run_sync_once_from_config, SyncConfig,
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tabsync")]
#[command(about = "TAB race feed synchronizer")]
struct Cli {
    /// YAML config overlay; falls back to TABSYNC_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and print its summary.
    Sync,
    /// Run a sync cycle on every tick of the poll cron until Ctrl-C.
    Watch,
    /// Fire per-event triggers until no events remain or Ctrl-C.
    Trigger,
    /// Show the active day collection and its final scheduled start.
    Latest,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tabsync=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let config = SyncConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_config(&config).await?;
            println!(
                "sync complete: cycle_id={} collection={} phase={:?} written={} inserted={} finalized={} odds={} unknown={} faults={} results_pulled={}",
                summary.cycle_id,
                summary.collection,
                summary.phase,
                summary.events_written,
                summary.events_inserted,
                summary.events_finalized,
                summary.odds_appended,
                summary.unknown_events,
                summary.faults,
                summary.results_pulled
            );
        }
        Commands::Watch => {
            let pipeline = Arc::new(build_pipeline(&config).await?);
            let mut sched = build_poll_scheduler(pipeline, &config.poll_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.poll_cron, "watching feed");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Trigger => {
            let mut scheduler = build_trigger_scheduler(&config)?;
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(true);
                }
            });
            let summary = scheduler.run(rx).await?;
            println!(
                "trigger loop finished: exit={:?} fired={} refreshes={} failed_refreshes={}",
                summary.exit, summary.fired, summary.refreshes, summary.failed_refreshes
            );
        }
        Commands::Latest => {
            let store = build_store(&config).await?;
            let today = Local::now().date_naive();
            let key = match active_collection(store.as_ref(), today).await? {
                Some(key) => Some(key),
                None => latest_collection(store.as_ref()).await?,
            };
            match key {
                Some(key) => {
                    let last_start = final_start_time(store.as_ref(), &key).await?;
                    println!(
                        "collection={} final_start={}",
                        key,
                        last_start.map(format_timestamp).unwrap_or_else(|| "-".to_string())
                    );
                }
                None => println!("no collections stored"),
            }
        }
    }

    Ok(())
}
