use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "apod-cli")]
#[command(about = "Loads NASA's Astronomy Picture of the Day into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full pipeline once.
    Run {
        /// Fail on the first error instead of applying the retry policy.
        #[arg(long)]
        no_retry: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    InitSchema,
    Verify,
    /// Run on the configured cron schedule until interrupted.
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
    let pipeline = apod_sync::connect_pipeline_from_env().await?;

    match cli.command.unwrap_or(Commands::Run {
        no_retry: false,
        json: false,
    }) {
        Commands::Run { no_retry, json } => {
            let summary = if no_retry {
                pipeline.run_once().await?
            } else {
                pipeline.run_with_retry().await?
            };
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                println!(
                    "run complete: run_id={} attempts={} date={} outcome=\"{}\" total_records={}",
                    summary.run_id,
                    summary.attempts,
                    summary.date,
                    summary.outcome,
                    summary.verification.total_records
                );
            }
        }
        Commands::InitSchema => {
            pipeline.init_schema().await?;
            println!("schema ready: table={}", pipeline.config().table);
        }
        Commands::Verify => {
            let report = pipeline.verify().await?;
            println!("{}", report.summary());
            if let Some(latest) = report.latest {
                println!("latest: {} ({})", latest.title, latest.date);
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set APOD_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler started");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("received shutdown signal");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
