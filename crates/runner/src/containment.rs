#![forbid(unsafe_code)]

use crate::pipeline::PipelineError;
use jp_core::JobState;
use jp_core::ids::JobId;
use jp_storage::{JobStore, StoreError, TransitionOutcome};
use std::fmt;
use std::path::PathBuf;

/// What a single job execution ended as, once failures have been contained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Processed(JobId),
    /// Another worker owns the job; nothing was written.
    LostRace {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },
    /// The job was moved to ERROR with the failure recorded in its log.
    Failed {
        job_id: JobId,
        category: FailureCategory,
        message: String,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            JobOutcome::Processed(job_id)
            | JobOutcome::LostRace { job_id, .. }
            | JobOutcome::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed { .. })
    }
}

/// Successful results of the supervised run, before containment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Processed(JobId),
    LostRace {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCategory {
    PreconditionFailure,
    ExecutionFailure,
    StoreFailure,
    UnexpectedState,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::PreconditionFailure => "PreconditionFailure",
            FailureCategory::ExecutionFailure => "ExecutionFailure",
            FailureCategory::StoreFailure => "StoreFailure",
            FailureCategory::UnexpectedState => "UnexpectedState",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Genuine failures of a claimed job. Losing the claim is not one of them.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("input file list {} not found for job {job_id}", path.display())]
    MissingManifest { job_id: JobId, path: PathBuf },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to list output files in {}: {source}", dir.display())]
    Outputs {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("job store: {0}")]
    Store(#[from] StoreError),
    /// The claim itself could not be evaluated; the job was last seen in `observed`.
    #[error("claim failed: job store: {source}")]
    Claim {
        observed: JobState,
        source: StoreError,
    },
    #[error("job {job_id} was expected to be {expected} but is {actual}")]
    UnexpectedState {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },
}

impl RunError {
    pub fn category(&self) -> FailureCategory {
        match self {
            RunError::MissingManifest { .. } => FailureCategory::PreconditionFailure,
            RunError::Pipeline(_) | RunError::Outputs { .. } => FailureCategory::ExecutionFailure,
            RunError::Store(_) | RunError::Claim { .. } => FailureCategory::StoreFailure,
            RunError::UnexpectedState { .. } => FailureCategory::UnexpectedState,
        }
    }
}

/// Runs `run` for `job_id` and turns any failure into a log entry plus a forced move to
/// ERROR.
///
/// `Err` is returned only when the store cannot record the failure itself.
pub fn contain<S, F>(store: &mut S, job_id: JobId, run: F) -> Result<JobOutcome, StoreError>
where
    S: JobStore,
    F: FnOnce(&mut S) -> Result<RunOutcome, RunError>,
{
    let err = match run(store) {
        Ok(RunOutcome::Processed(id)) => return Ok(JobOutcome::Processed(id)),
        Ok(RunOutcome::LostRace {
            job_id,
            expected,
            actual,
        }) => {
            return Ok(JobOutcome::LostRace {
                job_id,
                expected,
                actual,
            });
        }
        Err(err) => err,
    };

    let category = err.category();
    let message = err.to_string();
    tracing::error!(job_id = %job_id, category = %category, error = %message, "job failed");

    if let RunError::Claim { observed, .. } = err {
        return fail_unclaimed(store, job_id, observed, category, message);
    }

    if let Err(log_err) = store.add_log(job_id, &format!("{category}: {message}")) {
        tracing::warn!(job_id = %job_id, error = %log_err, "could not record failure in job log");
    }

    // Forced: the job is ours (claimed) or the failure predates knowing its state.
    match store.change_state(job_id, JobState::Error, &format!("Error: {message}"), None) {
        Ok(_) => {}
        Err(store_err) => {
            tracing::error!(job_id = %job_id, error = %store_err, "could not move job to ERROR");
            return Err(store_err);
        }
    }

    Ok(JobOutcome::Failed {
        job_id,
        category,
        message,
    })
}

/// The job was never ours: fail it only if it is still in the state we last saw.
fn fail_unclaimed<S: JobStore>(
    store: &mut S,
    job_id: JobId,
    observed: JobState,
    category: FailureCategory,
    message: String,
) -> Result<JobOutcome, StoreError> {
    let transition = format!("Error: {category}: {message}");
    match store.change_state(job_id, JobState::Error, &transition, Some(observed)) {
        Ok(TransitionOutcome::Applied) => Ok(JobOutcome::Failed {
            job_id,
            category,
            message,
        }),
        Ok(TransitionOutcome::Conflict { expected, actual }) => {
            tracing::warn!(job_id = %job_id, state = %actual, "job moved on after failed claim; not failing it");
            Ok(JobOutcome::LostRace {
                job_id,
                expected,
                actual,
            })
        }
        Err(store_err) => {
            tracing::error!(job_id = %job_id, error = %store_err, "could not move job to ERROR");
            Err(store_err)
        }
    }
}
