#![forbid(unsafe_code)]

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use jp_core::ids::JobId;
use jp_core::model::{JobRecord, LogEntry, NewJob};
use jp_core::{JobState, QaState};
use jp_runner::selector::select;
use jp_runner::{ProcConfig, init_logging};
use jp_storage::{JobStore, SqliteStore, StoreError, TransitionOutcome};
use serde::Serialize;
use std::process::ExitCode;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Operator tools for the processing job table.
#[derive(Debug, Parser)]
#[command(name = "jp_admin", version)]
struct Args {
    #[command(flatten)]
    config: ProcConfig,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue a new job at the configured location.
    Add {
        #[arg(long)]
        tag: String,
        #[arg(long, default_value = "night")]
        mode: String,
        #[arg(long, default_value = "")]
        parameters: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Raw input file name (repeatable).
        #[arg(long = "input")]
        inputs: Vec<String>,
    },
    /// List jobs at the configured location in one state, in run order.
    List {
        #[arg(long, default_value = "WAITING")]
        state: JobState,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print a job with its files and log.
    Show {
        job_id: JobId,
        #[arg(long)]
        json: bool,
    },
    /// Change a job's state. Forced unless `--expect` is given.
    SetState {
        job_id: JobId,
        state: JobState,
        /// Only apply if the job is currently in this state.
        #[arg(long)]
        expect: Option<JobState>,
        #[arg(long, default_value = "State changed by operator")]
        message: String,
    },
    /// Record a quality assessment.
    SetQa {
        job_id: JobId,
        qa_state: QaState,
        #[arg(long, default_value = "QA assessed by operator")]
        message: String,
    },
    /// Jobs in ERROR at the configured location with their logs.
    Errors,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("jp_admin: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut store = SqliteStore::open(&args.config.database)
        .with_context(|| format!("open job database {}", args.config.database.display()))?
        .with_host(args.config.worker_id())?;
    let location = args.config.location;

    match args.command {
        Command::Add {
            tag,
            mode,
            parameters,
            priority,
            inputs,
        } => {
            let id = store.add_job(NewJob {
                tag,
                location,
                mode,
                parameters,
                priority,
                input_files: inputs,
            })?;
            println!("{id}");
        }
        Command::List { state, limit } => {
            for job in select(&store, &location, state, limit, true)? {
                println!(
                    "{:>8}  {:<12}  {:>4}  {}",
                    job.id, job.state, job.priority, job.tag
                );
            }
        }
        Command::Show { job_id, json } => {
            let view = JobView::load(&store, job_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_job(&view);
            }
        }
        Command::SetState {
            job_id,
            state,
            expect,
            message,
        } => match store.change_state(job_id, state, &message, expect)? {
            TransitionOutcome::Applied => println!("job {job_id} -> {state}"),
            TransitionOutcome::Conflict { expected, actual } => {
                eprintln!("job {job_id} is {actual}, not {expected}; unchanged");
                return Ok(ExitCode::from(1));
            }
        },
        Command::SetQa {
            job_id,
            qa_state,
            message,
        } => {
            store.set_qa_state(job_id, qa_state, &message)?;
            println!("job {job_id} QA -> {qa_state}");
        }
        Command::Errors => {
            for (job_id, entries) in store.find_errors_logs(&location)? {
                println!("job {job_id}");
                for entry in entries {
                    println!("  {}  {}", format_ts(entry.ts_ms), entry.message);
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct JobView {
    id: i64,
    tag: String,
    state: String,
    phase: String,
    qa_state: String,
    location: String,
    mode: String,
    parameters: String,
    priority: i64,
    created_at: String,
    updated_at: String,
    input_files: Vec<String>,
    output_files: Vec<String>,
    log: Vec<LogView>,
}

#[derive(Debug, Serialize)]
struct LogView {
    at: String,
    state_prev: String,
    state_new: String,
    host: String,
    message: String,
}

impl JobView {
    fn load(store: &SqliteStore, job_id: JobId) -> Result<Self, StoreError> {
        let job = store.get_job(job_id)?;
        let input_files = store.get_input_files(job_id)?;
        let output_files = match store.get_output_files(job_id) {
            Ok(files) => files,
            Err(StoreError::NoOutputFiles(_)) => Vec::new(),
            Err(err) => return Err(err),
        };
        let log = store.get_logs(job_id)?.iter().map(LogView::from).collect();
        Ok(Self::new(job, input_files, output_files, log))
    }

    fn new(
        job: JobRecord,
        input_files: Vec<String>,
        output_files: Vec<String>,
        log: Vec<LogView>,
    ) -> Self {
        Self {
            id: job.id.get(),
            tag: job.tag,
            state: job.state.to_string(),
            phase: job.state.phase().to_string(),
            qa_state: job.qa_state.to_string(),
            location: job.location.to_string(),
            mode: job.mode,
            parameters: job.parameters,
            priority: job.priority,
            created_at: format_ts(job.created_at_ms),
            updated_at: format_ts(job.updated_at_ms),
            input_files,
            output_files,
            log,
        }
    }
}

impl From<&LogEntry> for LogView {
    fn from(entry: &LogEntry) -> Self {
        Self {
            at: format_ts(entry.ts_ms),
            state_prev: entry.state_prev.to_string(),
            state_new: entry.state_new.to_string(),
            host: entry.host.clone(),
            message: entry.message.clone(),
        }
    }
}

fn print_job(view: &JobView) {
    println!("job {} ({})", view.id, view.tag);
    println!("  state      {} [{}]", view.state, view.phase);
    println!("  qa         {}", view.qa_state);
    println!("  location   {}", view.location);
    println!("  mode       {}", view.mode);
    if !view.parameters.is_empty() {
        println!("  parameters {}", view.parameters);
    }
    println!("  priority   {}", view.priority);
    println!("  created    {}", view.created_at);
    println!("  updated    {}", view.updated_at);
    println!("  inputs     {}", view.input_files.len());
    for file in &view.input_files {
        println!("    {file}");
    }
    println!("  outputs    {}", view.output_files.len());
    for file in &view.output_files {
        println!("    {file}");
    }
    println!("  log");
    for entry in &view.log {
        println!(
            "    {}  {} -> {}  {}  {}",
            entry.at, entry.state_prev, entry.state_new, entry.host, entry.message
        );
    }
}

fn format_ts(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}
