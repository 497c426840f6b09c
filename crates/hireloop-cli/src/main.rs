use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hireloop_loxo::{FixtureRecruitingApi, LoxoClient, LoxoConfig, RecruitingApi};
use hireloop_storage::{MemoryCandidateStore, PgCandidateStore};
use hireloop_sync::{aggregate_candidates, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hireloop")]
#[command(about = "Loxo candidate ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync for the target stage.
    Sync {
        #[arg(long)]
        stage: Option<String>,
        /// Read Loxo data from a recorded fixture and write to an in-memory store.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Print the workflow stage taxonomy.
    Stages {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Print every candidate across every job.
    Candidates {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    Migrate,
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn recruiting_api(fixture: Option<&Path>) -> Result<Arc<dyn RecruitingApi>> {
    let api: Arc<dyn RecruitingApi> = match fixture {
        Some(path) => Arc::new(FixtureRecruitingApi::from_path(path)?),
        None => Arc::new(LoxoClient::new(LoxoConfig::from_env()?)?),
    };
    Ok(api)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        stage: None,
        fixture: None,
    }) {
        Commands::Sync { stage, fixture } => {
            let summary = match fixture {
                Some(path) => {
                    let pipeline = SyncPipeline::new(
                        SyncConfig::from_env(),
                        recruiting_api(Some(&path))?,
                        Arc::new(MemoryCandidateStore::new()),
                    );
                    pipeline.run_once(stage.as_deref()).await?
                }
                None => hireloop_sync::run_sync_once_from_env(stage.as_deref()).await?,
            };
            println!(
                "sync complete: run_id={} stage={:?} jobs={} failed_jobs={} aggregated={} filtered={} created={} linked={} updated={} skipped={} failed={}",
                summary.run_id,
                summary.target_stage,
                summary.jobs_total,
                summary.jobs_failed,
                summary.aggregated,
                summary.filtered,
                summary.created,
                summary.linked,
                summary.updated,
                summary.skipped,
                summary.failed
            );
        }
        Commands::Stages { fixture } => {
            let stages = recruiting_api(fixture.as_deref())?
                .list_workflow_stages()
                .await?;
            for stage in stages {
                println!("{}\t{}", stage.id, stage.name);
            }
        }
        Commands::Candidates { fixture } => {
            let api = recruiting_api(fixture.as_deref())?;
            let aggregation = aggregate_candidates(api.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&aggregation)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgCandidateStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = Arc::new(SyncPipeline::from_env().await?);
            let scheduler = hireloop_sync::maybe_build_scheduler(pipeline.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().sync_cron, "scheduled sync enabled");
            }
            hireloop_web::serve(pipeline).await?;
        }
    }

    Ok(())
}
