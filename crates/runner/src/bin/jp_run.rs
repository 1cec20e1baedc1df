#![forbid(unsafe_code)]

use anyhow::Context as _;
use clap::Parser;
use jp_core::ids::JobId;
use jp_runner::{ClaimMode, CommandPipeline, JobOutcome, ProcConfig, Worker, init_logging};
use jp_storage::SqliteStore;
use std::process::ExitCode;

/// Claim and run a single processing job.
///
/// Without `--job-id` the highest-priority WAITING job at the location is taken.
/// Exit status: 0 processed, nothing to do, or claimed elsewhere; 1 the job failed and
/// was moved to ERROR; 2 the job store could not be used.
#[derive(Debug, Parser)]
#[command(name = "jp_run", version)]
struct Args {
    #[command(flatten)]
    config: ProcConfig,

    /// Run this job instead of selecting one.
    #[arg(long)]
    job_id: Option<JobId>,

    /// Claim the job whatever its current state (operator override).
    #[arg(long, requires = "job_id")]
    force: bool,

    /// Reduction wrapper to execute.
    #[arg(long, env = "JP_PIPELINE_BIN", default_value = "jsawrapdr")]
    pipeline_bin: String,

    /// Cleanup policy passed through to the reduction wrapper.
    #[arg(long, env = "JP_CLEANUP", default_value = "cadc")]
    cleanup: String,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "job store unusable");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let worker_id = args.config.worker_id();
    let store = SqliteStore::open(&args.config.database)
        .with_context(|| format!("open job database {}", args.config.database.display()))?
        .with_host(worker_id.as_str())?;
    let pipeline = CommandPipeline::new(args.pipeline_bin.as_str(), args.cleanup.as_str());
    let mut worker = Worker::new(store, pipeline, args.config.directories(), worker_id);

    let outcome = match args.job_id {
        Some(job_id) => {
            let claim = if args.force {
                ClaimMode::Forced
            } else {
                ClaimMode::Waiting
            };
            Some(worker.run_job(job_id, claim)?)
        }
        None => worker.run_next(&args.config.location)?,
    };

    Ok(match outcome {
        Some(JobOutcome::Failed { .. }) => ExitCode::from(1),
        _ => ExitCode::SUCCESS,
    })
}
