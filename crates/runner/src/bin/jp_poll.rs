#![forbid(unsafe_code)]

use anyhow::Context as _;
use clap::Parser;
use jp_runner::{FilesystemConditions, Poller, ProcConfig, init_logging};
use jp_storage::SqliteStore;
use std::path::PathBuf;
use std::process::ExitCode;

/// One reconciliation sweep over the jobs at a location.
///
/// Moves jobs whose inputs have arrived to WAITING, jobs still lacking inputs to
/// MISSING, and transferred jobs to INGESTION. Exits 0 only if every job was checked
/// successfully.
#[derive(Debug, Parser)]
#[command(name = "jp_poll", version)]
struct Args {
    #[command(flatten)]
    config: ProcConfig,

    /// Directory searched for raw input files (repeatable; `:`-separated in the env var).
    #[arg(long = "data-root", env = "JP_DATA_ROOTS", value_delimiter = ':')]
    data_roots: Vec<PathBuf>,

    /// Staging directory where transferred products appear.
    #[arg(long, env = "JP_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "job store unusable");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> anyhow::Result<bool> {
    let store = SqliteStore::open(&args.config.database)
        .with_context(|| format!("open job database {}", args.config.database.display()))?
        .with_host(args.config.worker_id())?;
    let conditions = FilesystemConditions::new(args.data_roots, args.archive_dir);
    let mut poller = Poller::new(store, conditions, args.config.directories());
    Ok(poller.poll(&args.config.location))
}
