use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use metric_transform::{
    config::load_config_path,
    hashing::{HASH_KEY_VAR, RowHasher},
    io::LocalBlobStore,
    models::area::AreaType,
    pipeline::ChunkPipeline,
    population::PopulationTable,
};
use shared_utils::env::{get_env_or, get_env_var};
use timeseries_deploy::{
    db::{connection::connect_sqlite, migrate},
    deploy::BulkDeployer,
    registry::MetricIdCache,
    run::{Category, RunRequest, Subcategory},
    telemetry::init_tracing,
    workflow::{
        RetryPolicies, WorkflowController, WorkflowState,
        hooks::{AreaCoverageHook, MetadataRefreshHook},
        local::LocalActivities,
    },
};

#[derive(Parser)]
#[command(version, about = "Metric time-series deployment CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply pending schema migrations to DATABASE_URL.
    Migrate,
    /// Pipeline configuration commands.
    Config(ConfigCmd),
    /// Process one raw snapshot end to end.
    Run(RunArgs),
}

#[derive(Args)]
struct ConfigCmd {
    #[command(subcommand)]
    sub: ConfigSub,
}

#[derive(Subcommand)]
enum ConfigSub {
    /// Parse and normalize a configuration file.
    Check {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// `<container>/<path>` of the raw snapshot under the blob root.
    #[arg(long)]
    data_path: String,
    /// Release timestamp (RFC3339).
    #[arg(long)]
    timestamp: DateTime<Utc>,
    #[arg(long)]
    area_type: Option<AreaType>,
    #[arg(long, value_enum)]
    category: Option<Category>,
    #[arg(long, value_enum)]
    subcategory: Option<Subcategory>,
    /// Blob store root directory.
    #[arg(long, value_name = "DIR")]
    root: PathBuf,
    /// Pipeline configuration TOML.
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
    /// Population reference JSON.
    #[arg(long, value_name = "FILE")]
    population: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Migrate => {
            let db_url = get_env_var("DATABASE_URL")?;
            migrate::run_all(&db_url)?;
        }
        Cmd::Config(ConfigCmd {
            sub: ConfigSub::Check { file },
        }) => {
            let cfg = load_config_path(&file)?;
            println!(
                "{}: {} metrics, {} aliases, rolling window {}",
                file.display(),
                cfg.metrics.len(),
                cfg.aliases.len(),
                cfg.pipeline.rolling_window
            );
        }
        Cmd::Run(args) => run(args).await?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config = Arc::new(load_config_path(&args.config)?);
    let population = match &args.population {
        Some(path) => PopulationTable::load_path(path)?,
        None => PopulationTable::default(),
    };
    let hasher = RowHasher::from_env(HASH_KEY_VAR, config.pipeline.digest_size)?;

    let db_url = get_env_var("DATABASE_URL")?;
    migrate::run_all(&db_url)?;
    let metric_ids = Arc::new(MetricIdCache::new());
    let mut conn = connect_sqlite(&db_url)?;
    metric_ids.refresh(&mut conn).context("load metric ids")?;
    drop(conn);

    let deployer = BulkDeployer::new(hasher, config.pipeline.chunk_size, metric_ids);
    let pipeline = ChunkPipeline::new(config, Arc::new(population));
    let activities = LocalActivities::new(
        Arc::new(LocalBlobStore::new(args.root)),
        db_url,
        pipeline,
        deployer,
    )
    .with_hook(Arc::new(MetadataRefreshHook))
    .with_hook(Arc::new(AreaCoverageHook));

    let request = RunRequest {
        data_path: args.data_path,
        timestamp: args.timestamp,
        area_type: args.area_type,
        category: args.category,
        subcategory: args.subcategory,
    };
    let mut policies = RetryPolicies::default();
    policies.deploy.max_attempts = get_env_or("DEPLOY_MAX_ATTEMPTS", policies.deploy.max_attempts)?;
    let report = WorkflowController::new(Arc::new(activities), policies)
        .run(request)
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let WorkflowState::Failed(step) = report.state {
        anyhow::bail!("run {} failed at {step}", report.run_id);
    }
    Ok(())
}
