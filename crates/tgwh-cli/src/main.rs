use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tgwh_core::ClassTaxonomy;
use tgwh_pipeline::stages::{run_detect, run_ingest, run_load, run_migrate};
use tgwh_pipeline::{CommandDetector, PipelineConfig, RunLock, RunMode};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tgwh")]
#[command(about = "Telegram channel warehouse pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run ingest → detect → load → transform once.
    Run {
        /// Run ingest, detect and load as separate `tgwh` processes.
        #[arg(long)]
        isolated: bool,
    },
    Ingest(StageArgs),
    Detect(StageArgs),
    Load(StageArgs),
    /// Create the warehouse schema and tables if absent.
    Migrate,
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        isolated: bool,
    },
}

#[derive(Debug, clap::Args)]
struct StageArgs {
    /// Join an existing run; the parent process holds the run lock.
    #[arg(long, hide = true)]
    run_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tgwh=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .init();

    let cli = Cli::parse();
    match dispatch(cli.command.unwrap_or(Commands::Run { isolated: false })).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Commands) -> Result<ExitCode> {
    let config = Arc::new(PipelineConfig::from_env());
    config.log_summary();

    match command {
        Commands::Run { isolated } => {
            let report = tgwh_pipeline::run_pipeline_once(config, run_mode(isolated)?).await?;
            println!("run {}: {}", report.run_id, report.outcome);
            if let tgwh_pipeline::RunOutcome::FailedAt { diagnostic, .. } = &report.outcome {
                eprintln!("{diagnostic}");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Ingest(args) => {
            let (run_id, _lock) = join_or_lock(&config, args)?;
            let summary = run_ingest(&config, run_id).await?;
            info!(
                %run_id,
                channels = summary.channels.len(),
                messages = summary.total_messages(),
                failed = summary.failed_channels().count(),
                "ingest finished"
            );
        }
        Commands::Detect(args) => {
            let (run_id, _lock) = join_or_lock(&config, args)?;
            let detector =
                CommandDetector::new(config.detector_program.clone(), config.detector_args.clone());
            let summary = run_detect(&config, &detector, &ClassTaxonomy::default()).await?;
            info!(%run_id, %summary, "detect finished");
        }
        Commands::Load(args) => {
            let (run_id, _lock) = join_or_lock(&config, args)?;
            let summary = run_load(&config).await?;
            info!(%run_id, %summary, "load finished");
        }
        Commands::Migrate => {
            run_migrate(&config).await?;
            info!(database = %config.redacted_database_url(), "warehouse schema ensured");
        }
        Commands::Schedule { isolated } => {
            let exe = match run_mode(isolated)? {
                RunMode::Isolated(exe) => Some(exe),
                RunMode::InProcess => None,
            };
            let cron = config.schedule_cron.clone();
            let mut sched = tgwh_pipeline::scheduler::build_scheduler(config, exe).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_mode(isolated: bool) -> Result<RunMode> {
    if isolated {
        let exe = std::env::current_exe().context("locating the tgwh executable")?;
        Ok(RunMode::Isolated(exe))
    } else {
        Ok(RunMode::InProcess)
    }
}

/// A stage started by a parent run reuses its id; a standalone stage takes
/// the run lock itself.
fn join_or_lock(config: &PipelineConfig, args: StageArgs) -> Result<(Uuid, Option<RunLock>)> {
    match args.run_id {
        Some(run_id) => Ok((run_id, None)),
        None => {
            let run_id = Uuid::new_v4();
            let lock = RunLock::acquire(&config.lock_path(), run_id, config.lock_stale_after())?;
            Ok((run_id, Some(lock)))
        }
    }
}
