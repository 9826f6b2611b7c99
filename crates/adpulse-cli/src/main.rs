use std::sync::Arc;

use adpulse_pipeline::{
    manual_refresh_all, maybe_build_scheduler, run_full_refresh, BatchOrchestrator, MetricsStore,
    PgMetricsStore, PipelineConfig,
};
use adpulse_report::FactSource;
use adpulse_web::AppState;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adpulse")]
#[command(about = "AdPulse metrics cache and refresh pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the cron scheduler when enabled).
    Serve,
    /// Run one scheduled-style refresh chain to completion.
    Refresh,
    /// Refresh every entity through the concurrent manual fan-out.
    Fanout,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let (store, source) = connect(&config).await?;
            let orchestrator = Arc::new(BatchOrchestrator::new(
                Arc::clone(&source),
                Arc::clone(&store),
                config.batch_size,
                config.time_budget,
            ));

            let scheduler =
                maybe_build_scheduler(&config, Arc::clone(&orchestrator), Arc::clone(&store))
                    .await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %config.refresh_cron, "refresh scheduler started");
            }

            let port: u16 = std::env::var("ADPULSE_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            info!(port, "serving adpulse api");
            adpulse_web::serve(
                AppState {
                    store,
                    source,
                    orchestrator,
                    fanout_width: config.fanout_width,
                    fanout_delay: config.fanout_delay,
                },
                port,
            )
            .await
        }
        Commands::Refresh => {
            let (store, source) = connect(&config).await?;
            let orchestrator = BatchOrchestrator::new(
                source,
                Arc::clone(&store),
                config.batch_size,
                config.time_budget,
            );
            let (job, progress) = run_full_refresh(&orchestrator, store.as_ref(), false).await?;
            println!(
                "refresh complete: job_id={} processed={} total={} success={}",
                job.id, progress.processed, progress.total, job.videos_success
            );
            Ok(())
        }
        Commands::Fanout => {
            let (store, source) = connect(&config).await?;
            let summary =
                manual_refresh_all(source, store, config.fanout_width, config.fanout_delay).await?;
            println!(
                "manual refresh complete: job_id={} updated={} failed={} duration_ms={}",
                summary.job_id, summary.updated, summary.failed, summary.duration_ms
            );
            Ok(())
        }
        Commands::Migrate => {
            let pool = PgPoolOptions::new()
                .connect(&config.database_url)
                .await
                .context("connecting to database")?;
            adpulse_pipeline::MIGRATOR
                .run(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn connect(config: &PipelineConfig) -> Result<(Arc<dyn MetricsStore>, Arc<dyn FactSource>)> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let store: Arc<dyn MetricsStore> = Arc::new(PgMetricsStore::new(pool));
    let source: Arc<dyn FactSource> = Arc::new(config.report_client()?);
    Ok((store, source))
}
