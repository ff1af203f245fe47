mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use actsync_storage::{EndpointSource, PgActivityStore};
use actsync_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline, YamlEndpointRegistry};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "actsync-cli")]
#[command(about = "Activity import and reconciliation")]
struct Cli {
    /// YAML endpoint registry; overrides ACTSYNC_ENDPOINTS_FILE.
    #[arg(long, global = true)]
    endpoints_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print the run summary as JSON.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Run syncs on ACTSYNC_SYNC_CRON until interrupted.
    Schedule,
    /// List the configured endpoints.
    Endpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_subscriber()?;
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.endpoints_file {
        config.endpoints_file = Some(path);
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = PgActivityStore::connect(&config.database_url)
                .await
                .context("connecting to the database")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
                bail!("scheduler is disabled; set ACTSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Endpoints => {
            let endpoints = match &config.endpoints_file {
                Some(path) => YamlEndpointRegistry::new(path).load_endpoints().await?,
                None => PgActivityStore::connect(&config.database_url)
                    .await
                    .context("connecting to the database")?
                    .load_endpoints()
                    .await?,
            };
            for endpoint in endpoints {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    endpoint.id,
                    endpoint.kind.map(|k| k.as_str()).unwrap_or("-"),
                    endpoint.area.as_deref().unwrap_or("-"),
                    endpoint.url,
                    endpoint.description
                );
            }
        }
    }

    Ok(())
}
