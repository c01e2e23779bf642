use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use grants_core::RecordField;
use grants_storage::FsStorage;
use grants_sync::{
    filter_closing_grants, load_latest_dataset, DatasetInsights, GrantsPipeline, SyncConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "grants-cli")]
#[command(about = "Grants extract pipeline command-line interface")]
struct Cli {
    /// Bucket directory.
    #[arg(long, global = true, env = "GRANTS_BUCKET_DIR")]
    bucket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clean, fetch, unpack, extract and write today's dataset.
    Run {
        /// Feed date to fetch (YYYY-MM-DD) instead of today.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Delete stale archives, documents and datasets.
    Clean,
    /// List grants from the latest dataset closing within the next N days.
    Show {
        #[arg(long, default_value_t = 20)]
        days: u32,
        /// Reference date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grants=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(bucket) = cli.bucket {
        config.bucket_dir = bucket;
    }

    match cli.command.unwrap_or(Commands::Run {
        date: None,
        json: false,
    }) {
        Commands::Run { date, json } => {
            let pipeline = GrantsPipeline::new(config)?;
            let summary = match date {
                Some(date) => pipeline.run_for_date(date).await,
                None => pipeline.run_once().await,
            }
            .context("pipeline run failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "run complete: run_id={} source={} records={} dataset={} bytes={} sha256={}",
                    summary.run_id,
                    summary.archive_url,
                    summary.records,
                    summary.dataset_key,
                    summary.dataset_bytes,
                    summary.dataset_sha256
                );
            }
        }
        Commands::Clean => {
            let pipeline = GrantsPipeline::new(config)?;
            let deleted = pipeline.clean().await.context("cleaning bucket")?;
            for key in &deleted {
                println!("deleted {key}");
            }
            println!("clean complete: {} objects removed", deleted.len());
        }
        Commands::Show { days, today } => {
            let storage = FsStorage::new(config.bucket_dir.clone());
            let Some(dataset) = load_latest_dataset(&storage)
                .await
                .context("loading dataset")?
            else {
                println!("No Parquet files found in {}.", config.bucket_dir.display());
                return Ok(());
            };

            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let selected = filter_closing_grants(&dataset.records, today, days);
            let insights = DatasetInsights::from_records(&selected);
            println!("Data loaded from: {}", dataset.key);
            println!("Record count: {}", insights.record_count);
            println!("Filter applied for the next {days} days.");
            println!("Earliest Close Date: {}", fmt_date(insights.earliest_close_date));
            println!("Latest Close Date: {}", fmt_date(insights.latest_close_date));
            for record in &selected {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.text(RecordField::OpportunityNumber).unwrap_or("-"),
                    fmt_date(record.close_date()),
                    record.text(RecordField::AgencyCode).unwrap_or("-"),
                    record.text(RecordField::OpportunityTitle).unwrap_or("-"),
                );
            }
        }
        Commands::Schedule => {
            let pipeline = GrantsPipeline::new(config)?;
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                eprintln!("scheduler disabled; set GRANTS_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %pipeline.config().sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}

fn fmt_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn bucket_comes_from_flag_or_environment() {
        Cli::command().debug_assert();

        std::env::set_var("GRANTS_BUCKET_DIR", "/from/env");
        let cli = Cli::try_parse_from(["grants-cli", "show"]).expect("parse");
        assert_eq!(cli.bucket, Some(PathBuf::from("/from/env")));

        let cli = Cli::try_parse_from(["grants-cli", "clean", "--bucket", "/from/flag"])
            .expect("parse");
        assert_eq!(cli.bucket, Some(PathBuf::from("/from/flag")));
        assert!(matches!(cli.command, Some(Commands::Clean)));
        std::env::remove_var("GRANTS_BUCKET_DIR");
    }
}
