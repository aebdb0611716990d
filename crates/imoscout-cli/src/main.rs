use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imoscout_sync::{SourceRunSummary, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "imoscout")]
#[command(about = "Track property listings across Portuguese real-estate portals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled source in sources.yaml.
    Sync,
    /// Reconcile a single source.
    Consolidate {
        #[arg(long)]
        source: String,
        /// Batch file to use instead of the configured one.
        #[arg(long)]
        batch: Option<PathBuf>,
    },
    /// Print a digest of the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = SyncPipeline::new(config).run_once().await?;
            print_summary(&summary);
        }
        Commands::Consolidate { source, batch } => {
            let summary = SyncPipeline::new(config)
                .consolidate_source(&source, batch)
                .await?;
            print_summary(&summary);
        }
        Commands::Report { runs } => {
            let markdown =
                imoscout_sync::report_daily_markdown(runs, Some(config.workspace_root.clone()))?;
            println!("{markdown}");

            let counts = SyncPipeline::new(config).consolidated_counts().await?;
            println!("## Consolidated collections");
            for (source_id, (stored, available)) in counts {
                println!("- {source_id}: {stored} stored, {available} available");
            }
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config));

            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} sources={} inserted={} marked_unavailable={} reports={}",
        summary.run_id,
        summary.sources.len(),
        summary.total_inserted(),
        summary.total_marked_unavailable(),
        summary.reports_dir
    );
    for source in &summary.sources {
        print_source(source);
    }
}

fn print_source(source: &SourceRunSummary) {
    println!(
        "  {}: raw={} unique={} inserted={} rejected={} unavailable={} available={}",
        source.source_id,
        source.raw_count,
        source.unique_count,
        source.inserted_ids.len(),
        source.rejected.len(),
        source.marked_unavailable.len(),
        source.marked_available.len()
    );
}
