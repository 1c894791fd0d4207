use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xtrobe_adapters::PageRange;
use xtrobe_notify::{NotificationScheduler, NotifyConfig};
use xtrobe_sync::{SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "xtrobe")]
#[command(about = "Space news, sky events and launch schedule aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Aggregate one source and print its records as JSON.
    Aggregate {
        source: String,
        #[arg(long, requires = "last")]
        first: Option<u32>,
        #[arg(long, requires = "first")]
        last: Option<u32>,
        /// Print page/fragment counters instead of records.
        #[arg(long)]
        report: bool,
    },
    /// Schedule a launch reminder and wait for it to be delivered.
    Notify {
        email: String,
        title: String,
        /// Local time, `YYYY-MM-DD HH:MM:SS`.
        launch_time: String,
    },
    /// List configured sources.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => xtrobe_web::serve_from_env().await?,
        Commands::Aggregate {
            source,
            first,
            last,
            report,
        } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
            let outcome = match (first, last) {
                (Some(first), Some(last)) => {
                    pipeline
                        .run_source_pages(&source, PageRange::new(first, last))
                        .await
                }
                _ => pipeline.run_source(&source).await,
            }
            .with_context(|| format!("aggregating {source}"))?;

            if report {
                println!(
                    "{source}: records={} pages={} pages_failed={} fragments={} fragments_failed={} duplicates={}",
                    outcome.records.len(),
                    outcome.pages_total,
                    outcome.pages_failed,
                    outcome.fragments_total,
                    outcome.fragments_failed,
                    outcome.duplicates_dropped
                );
            } else {
                println!("{}", serde_json::to_string_pretty(&outcome.records)?);
            }
        }
        Commands::Notify {
            email,
            title,
            launch_time,
        } => {
            let config = NotifyConfig::from_env();
            let scheduler = NotificationScheduler::new(config.build_mailer()?, config.sender)?;
            let task_id = scheduler.schedule(&email, &title, &launch_time)?;
            info!(%task_id, "waiting for reminder to fire");
            while scheduler.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let pipeline = SyncPipeline::new(config).await?;
            for source in &pipeline.registry().sources {
                let pages = match source.page_range() {
                    Some(range) => format!("pages {}..={}", range.first, range.last),
                    None => "default pages".to_string(),
                };
                println!(
                    "{:<16} {:<8} {} ({pages})",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.base_url
                );
            }
        }
    }

    Ok(())
}
