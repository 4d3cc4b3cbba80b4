use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use permitiq_source::discovery::render_summary;
use permitiq_sync::{
    build_source, build_store, maybe_build_scheduler, refresh_statistics, run_discovery,
    run_pipeline, table_counts, write_discovery_report, PermitPipeline, PipelineConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "permitiq")]
#[command(about = "PermitIQ environmental permit ETL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, transform, dedupe and load every permit once.
    Sync {
        /// Do everything except write to the store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Profile the fields and geometry of a sample page.
    Discover {
        #[arg(long, default_value_t = 100)]
        sample: u32,
        #[arg(long, default_value = "docs/planning/api_field_discovery.json")]
        output: PathBuf,
    },
    /// Refresh derived statistics in the store.
    Stats {
        #[arg(long, default_value_t = 7)]
        days_back: u32,
    },
    /// Print row counts of the permit tables.
    Count,
    /// Run syncs on the configured cron until interrupted.
    Schedule,
}

fn init_tracing(config: &PipelineConfig) -> Result<()> {
    let filter = match config.log_filter() {
        Some(directive) => EnvFilter::try_new(&directive)
            .with_context(|| format!("invalid PERMITIQ_LOG_LEVEL {directive:?}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;
    init_tracing(&config)?;

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            config.dry_run |= dry_run;
            let result = run_pipeline(config).await?;
            println!(
                "sync complete: run_id={} dry_run={} fetched={} unique={} loaded={} duration={:.1}s",
                result.run_id,
                result.dry_run,
                result.records_fetched,
                result.records_unique,
                result.records_loaded,
                result.duration.as_secs_f64()
            );
        }
        Commands::Discover { sample, output } => {
            let source = build_source(&config)?;
            let report = run_discovery(&source, sample).await?;
            write_discovery_report(&report, &output).await?;
            println!("{}", render_summary(&report));
            println!("Full report saved to: {}", output.display());
        }
        Commands::Stats { days_back } => {
            let store = build_store(&config)?;
            refresh_statistics(&store, days_back).await?;
            println!("statistics refreshed for the last {days_back} days");
        }
        Commands::Count => {
            let store = build_store(&config)?;
            for (table, count) in table_counts(&store).await? {
                println!("{table:<20} {count}");
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(
                PermitPipeline::from_config(&config).context("building pipeline for scheduler")?,
            );
            let Some(mut sched) = maybe_build_scheduler(pipeline, &config).await? else {
                anyhow::bail!("scheduling is disabled; set PERMITIQ_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
