use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use esqr_store::{
    DateFilter, HttpDocumentStore, HttpMailer, HttpWorkQueue, PgSubmissionSource,
};
use esqr_sync::{
    build_scheduler, populate_digest_queue, process_digest_queue, reconcile_exports,
    should_run_monthly, AppConfig, RecipientDirectory,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "esqr-cli")]
#[command(about = "ESQ digest and export pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one day's submissions and queue one digest per subject.
    Populate {
        /// Submission date to fetch; defaults to yesterday.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Drain the digest queue and dispatch the emails.
    Process,
    /// Monthly create-or-append pass over both role exports.
    Reconcile {
        /// Run even when today is not the first of the month.
        #[arg(long)]
        force: bool,
    },
    /// Run the cron triggers until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let timeout = Duration::from_secs(config.http_timeout_secs);

    match cli.command {
        Commands::Populate { date } => {
            let window = date.unwrap_or_else(|| Utc::now().date_naive() - ChronoDuration::days(1));
            let source = PgSubmissionSource::connect(&config.database_url)
                .await
                .context("connecting to submission database")?;
            let queue = HttpWorkQueue::new(&config.queue_url, &config.queue_name, timeout)
                .context("building queue client")?;
            let recipients =
                RecipientDirectory::for_config(&config).context("loading recipient directory")?;

            let summary = populate_digest_queue(
                &config,
                &source,
                &queue,
                &recipients,
                DateFilter::Exact(window),
            )
            .await?;
            println!(
                "populate complete: date={} fetched={} digests={} enqueued={} deduplicated={}",
                window, summary.fetched, summary.digests, summary.enqueued, summary.deduplicated
            );
        }
        Commands::Process => {
            let queue = HttpWorkQueue::new(&config.queue_url, &config.queue_name, timeout)
                .context("building queue client")?;
            let mailer = HttpMailer::new(
                &config.mail_relay_url,
                &config.smtp_host,
                config.smtp_port,
                timeout,
            )
            .context("building mail client")?;

            let summary = process_digest_queue(&config, &queue, &mailer).await?;
            println!(
                "process complete: processed={} sent={} failed={}",
                summary.processed, summary.sent, summary.failed
            );
        }
        Commands::Reconcile { force } => {
            let today = Utc::now().date_naive();
            if !should_run_monthly(today, force) {
                info!(%today, "not the first of the month; skipping reconciliation");
                return Ok(());
            }

            let source = PgSubmissionSource::connect(&config.database_url)
                .await
                .context("connecting to submission database")?;
            let store = HttpDocumentStore::new(&config.docstore_url, timeout)
                .context("building document store client")?;

            let summary = reconcile_exports(&config, &source, &store, today).await?;
            for outcome in &summary.outcomes {
                println!("reconciled {}: {:?}", outcome.file, outcome.action);
            }
        }
        Commands::Schedule => match build_scheduler(&config).await? {
            Some(sched) => {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler running; press ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            }
            None => {
                eprintln!("scheduler disabled; set ESQR_SCHEDULER_ENABLED=1 to enable");
            }
        },
    }

    Ok(())
}
