use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::{Configuration, JobConfig};
use common::store::{SnapshotStore, ZfsCli};
use common::shutdown;
use job::{JobError, LocalJob, Side, build_jobs, run_jobs};
use pruner::PruneRunResult;
use replication::LocalReplication;

#[derive(Parser)]
#[command(name = "dsrepl")]
#[command(about = "dsrepl - periodic ZFS snapshots, local replication and pruning")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<DsreplCommands>,
}

#[derive(Subcommand)]
enum DsreplCommands {
    #[command(flatten)]
    Common(CommonCommands),
    /// Show what one pruning pass of a job would destroy, without destroying
    Prune {
        /// Job name
        job: String,
        /// Side to prune: left (sender) or right (receiver)
        #[arg(long, default_value = "left")]
        side: Side,
    },
}

impl Default for DsreplCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command.unwrap_or_default() {
        DsreplCommands::Common(command) => {
            if utils::handle_common_command(&command, &config)? {
                return Ok(());
            }
            run_daemon(config).await
        }
        DsreplCommands::Prune { job, side } => prune_dry_run(&config, &job, side).await,
    }
}

async fn run_daemon(config: Configuration) -> Result<()> {
    utils::validate_config(&config)?;

    let store: Arc<dyn SnapshotStore> = Arc::new(ZfsCli::from_config(&config.zfs));
    let jobs = build_jobs(&config, store, Arc::new(LocalReplication::new()))
        .context("Failed to build jobs")?;
    if jobs.is_empty() {
        tracing::warn!("No jobs configured, nothing to do");
        return Ok(());
    }

    tracing::info!(
        jobs = jobs.len(),
        zfs = %config.zfs.binary,
        "Starting dsrepl"
    );

    let ctx = shutdown::install_shutdown_handler();
    run_jobs(jobs, ctx).await;

    tracing::info!("dsrepl stopped");
    Ok(())
}

async fn prune_dry_run(config: &Configuration, name: &str, side: Side) -> Result<()> {
    let Some(JobConfig::Local(job_config)) = config.job(name) else {
        return Err(JobError::UnknownJob(name.to_string()).into());
    };

    let store: Arc<dyn SnapshotStore> = Arc::new(ZfsCli::from_config(&config.zfs));
    let job = LocalJob::from_config(
        job_config,
        Arc::clone(&store),
        Arc::new(LocalReplication::new()),
    )
    .with_context(|| format!("Failed to set up job '{name}'"))?;
    let pruner = job
        .pruner(side, true)
        .with_context(|| format!("Failed to create {side} pruner for job '{name}'"))?;

    let ctx = shutdown::install_shutdown_handler();
    let result = pruner.run(&ctx, store.as_ref()).await;
    print_prune_result(name, side, &result);
    Ok(())
}

fn print_prune_result(job: &str, side: Side, result: &PruneRunResult) {
    println!("Dry-run pruning of job '{job}' ({side} side):");
    for error in &result.errors {
        println!("  error: {error}");
    }
    for dataset in &result.datasets {
        println!("  {}", dataset.dataset);
        for name in &dataset.kept {
            println!("    keep     {name}");
        }
        for name in &dataset.removed {
            println!("    destroy  {name}");
        }
        for error in &dataset.errors {
            println!("    error    {error}");
        }
    }
    println!(
        "{} dataset(s), {} snapshot(s) would be destroyed",
        result.datasets.len(),
        result.total_removed()
    );
    if result.cancelled {
        println!("(interrupted)");
    }
}
