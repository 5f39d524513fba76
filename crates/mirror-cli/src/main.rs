use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mirror_core::JobId;
use mirror_sync::{connect_pool, SyncConfig, SyncService};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mirror-cli")]
#[command(about = "Connector mirror sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync job per enabled connector.
    Sync {
        /// Only sync this connector.
        #[arg(long)]
        connector: Option<String>,
        /// Run an already-queued job instead of creating new ones.
        #[arg(long, conflicts_with = "connector")]
        job: Option<JobId>,
    },
    /// Apply database migrations.
    Migrate,
    /// List recent jobs of the configured connectors.
    Jobs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        connector: None,
        job: None,
    }) {
        Commands::Sync { connector, job } => {
            let service = SyncService::from_config(config).await?;
            if let Some(job_id) = job {
                let report = service.run_queued(job_id).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let outcomes = service.run_once(connector.as_deref()).await?;
            let mut failed = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(report) => println!(
                        "sync complete: source={} scope={} job_id={} {}",
                        outcome.source_id,
                        outcome.scope,
                        report.job_id,
                        serde_json::to_string(&report.resources)?
                    ),
                    Err(err) => {
                        failed += 1;
                        eprintln!(
                            "sync failed: source={} scope={} kind={} error={err}",
                            outcome.source_id,
                            outcome.scope,
                            err.kind()
                        );
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} connectors failed", outcomes.len());
            }
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url).await?;
            mirror_storage::postgres::run_migrations(&pool)
                .await
                .context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Jobs { limit } => {
            let service = SyncService::from_config(config).await?;
            for job in service.recent_jobs(limit).await? {
                println!(
                    "{} {} {:<9} created={} error={}",
                    job.id,
                    job.scope,
                    job.status.as_str(),
                    job.created_at.to_rfc3339(),
                    job.error.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Schedule => {
            let service = Arc::new(SyncService::from_config(config).await?);
            let Some(mut sched) = service.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set MIRROR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
