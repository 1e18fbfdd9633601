//! CoinGecko pipeline command line
//!
//! Run with: `cargo run --bin coingecko-pipeline -- --config params.toml run`
//!
//! The API key is read from `COINGECKO_API_KEY`; set `RUST_LOG` to control
//! log verbosity (default `info`).

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use coingecko_pipeline::{Credentials, Pipeline, PipelineConfig, RunReport, RunState, Scheduler};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coingecko-pipeline", about = "Daily CoinGecko ingest, transform and training pipeline")]
struct Cli {
    /// Pipeline configuration file
    #[arg(long, global = true, default_value = "params.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and load the day before the logical date
    Ingest {
        /// Logical (trigger) date, defaults to today in UTC
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Rebuild every SQL model for a logical date
    Transform {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Full run (ingest then transform) with run bookkeeping
    Run {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Re-run a date that already succeeded
        #[arg(long)]
        force: bool,
    },
    /// Run every logical date in an inclusive range, oldest first
    Backfill {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Run due dates on the daily trigger
    Schedule {
        /// Run what is currently due and exit
        #[arg(long)]
        once: bool,
    },
    /// Train and log the price-direction model
    Train,
}

impl Command {
    /// Commands that call the CoinGecko API.
    fn needs_api(&self) -> bool {
        matches!(
            self,
            Command::Ingest { .. } | Command::Run { .. } | Command::Backfill { .. } | Command::Schedule { .. }
        )
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn failed_dates(reports: &[RunReport]) -> Vec<String> {
    reports
        .iter()
        .filter(|report| report.state == RunState::Failed)
        .map(|report| report.logical_date.to_string())
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_file(&cli.config)?;
    let credentials = Credentials::from_env();
    if cli.command.needs_api() {
        credentials.require_api_key()?;
    }
    let mut pipeline = Pipeline::new(config, &credentials)?;
    let today = Utc::now().date_naive();

    match cli.command {
        Command::Ingest { date } => {
            let report = pipeline.ingest(date.unwrap_or(today)).await?;
            print_json(&report)?;
        }
        Command::Transform { date } => {
            let runs = pipeline.transform(date.unwrap_or(today))?;
            print_json(&runs)?;
        }
        Command::Run { date, force } => {
            let report = pipeline.run(date.unwrap_or(today), force).await?;
            print_json(&report)?;
            if report.state == RunState::Failed {
                return Err(format!("run for {} failed", report.logical_date).into());
            }
        }
        Command::Backfill { from, to } => {
            let reports = pipeline.backfill(from, to).await?;
            print_json(&reports)?;
            let failed = failed_dates(&reports);
            if !failed.is_empty() {
                return Err(format!("failed logical dates: {}", failed.join(", ")).into());
            }
        }
        Command::Schedule { once } => {
            let mut scheduler = Scheduler::new(pipeline);
            if once {
                let reports = scheduler.tick(Utc::now().naive_utc()).await?;
                print_json(&reports)?;
            } else {
                scheduler.run_forever().await?;
            }
        }
        Command::Train => {
            let report = pipeline.train().await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
