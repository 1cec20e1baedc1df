#![forbid(unsafe_code)]

use crate::config::Directories;
use crate::containment::{JobOutcome, RunError, RunOutcome, contain};
use crate::pipeline::{Pipeline, PipelineRequest, collect_output_files};
use crate::selector::next_waiting;
use jp_core::JobState;
use jp_core::ids::{JobId, Location};
use jp_storage::{JobStore, StoreError, TransitionOutcome};

/// How the worker takes ownership of a job before running it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimMode {
    /// Normal path: the job must still be WAITING.
    Waiting,
    /// Operator override on an explicit job id.
    Forced,
}

impl ClaimMode {
    fn expected(self) -> Option<JobState> {
        match self {
            ClaimMode::Waiting => Some(JobState::Waiting),
            ClaimMode::Forced => None,
        }
    }
}

/// Claims jobs and drives them through the reduction pipeline, one at a time.
///
/// The store handle is owned by the worker; several workers coordinate only through
/// the conditional claim in [`JobStore::change_state`].
pub struct Worker<S, P> {
    store: S,
    pipeline: P,
    dirs: Directories,
    worker_id: String,
}

impl<S: JobStore, P: Pipeline> Worker<S, P> {
    pub fn new(store: S, pipeline: P, dirs: Directories, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            pipeline,
            dirs,
            worker_id: worker_id.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Selects the highest-priority WAITING job at `location` and runs it.
    ///
    /// `Ok(None)` means there was nothing to do.
    pub fn run_next(&mut self, location: &Location) -> Result<Option<JobOutcome>, StoreError> {
        let Some(job) = next_waiting(&self.store, location)? else {
            tracing::warn!(location = %location, "no waiting jobs found");
            return Ok(None);
        };
        tracing::debug!(job_id = %job.id, priority = job.priority, "selected job");
        self.run_job(job.id, ClaimMode::Waiting).map(Some)
    }

    /// Runs one job with failures contained: anything but a lost claim ends in ERROR.
    pub fn run_job(&mut self, job_id: JobId, claim: ClaimMode) -> Result<JobOutcome, StoreError> {
        // An unknown id has no log to record a failure in.
        let observed = self.store.get_job(job_id)?.state;

        let Self {
            store,
            pipeline,
            dirs,
            worker_id,
        } = self;
        let outcome = contain(store, job_id, |store| {
            execute(store, pipeline, dirs, worker_id.as_str(), job_id, claim, observed)
        })?;

        match &outcome {
            JobOutcome::Processed(id) => tracing::info!(job_id = %id, "job processed"),
            JobOutcome::LostRace { actual, .. } => {
                tracing::info!(job_id = %job_id, state = %actual, "job claimed elsewhere")
            }
            JobOutcome::Failed { .. } => {}
        }
        Ok(outcome)
    }
}

fn execute<S: JobStore, P: Pipeline>(
    store: &mut S,
    pipeline: &mut P,
    dirs: &Directories,
    worker_id: &str,
    job_id: JobId,
    claim: ClaimMode,
    observed: JobState,
) -> Result<RunOutcome, RunError> {
    let message = match claim {
        ClaimMode::Waiting => format!("Job is about to be run on host {worker_id}"),
        ClaimMode::Forced => format!("Job is about to be run on host {worker_id} (forced)"),
    };
    let claimed = store
        .change_state(job_id, JobState::Running, &message, claim.expected())
        .map_err(|source| RunError::Claim { observed, source })?;
    match claimed {
        TransitionOutcome::Applied => {}
        TransitionOutcome::Conflict { expected, actual } => {
            tracing::warn!(
                job_id = %job_id,
                expected = %expected,
                actual = %actual,
                "job is no longer waiting; leaving it to its owner"
            );
            return Ok(RunOutcome::LostRace {
                job_id,
                expected,
                actual,
            });
        }
    }

    let manifest = dirs.input_manifest(job_id);
    if !manifest.is_file() {
        return Err(RunError::MissingManifest {
            job_id,
            path: manifest,
        });
    }

    let job = store.get_job(job_id)?;
    let output_dir = dirs.output_dir(job_id);
    let log_path = dirs.pipeline_log(job_id);
    pipeline.run(&PipelineRequest {
        job_id,
        manifest: &manifest,
        mode: &job.mode,
        parameters: &job.parameters,
        output_dir: &output_dir,
        log_path: &log_path,
    })?;

    let outputs = collect_output_files(&output_dir).map_err(|source| RunError::Outputs {
        dir: output_dir.clone(),
        source,
    })?;
    tracing::debug!(job_id = %job_id, count = outputs.len(), "recording output files");
    store.set_output_files(job_id, &outputs)?;

    match store.change_state(
        job_id,
        JobState::Processed,
        "Job has been successfully processed",
        Some(JobState::Running),
    )? {
        TransitionOutcome::Applied => Ok(RunOutcome::Processed(job_id)),
        TransitionOutcome::Conflict { expected, actual } => Err(RunError::UnexpectedState {
            job_id,
            expected,
            actual,
        }),
    }
}
