#![forbid(unsafe_code)]

use super::{JobQuery, StoreError};
use jp_core::ids::{JobId, Location};
use jp_core::model::{JobRecord, LogEntry, NewJob};
use jp_core::{JobState, QaState};
use std::collections::BTreeMap;

/// Result of a state transition that the store was able to evaluate.
///
/// `Conflict` means the job exists but was not in the expected prior state, so nothing
/// was written. It is not an error: it is how a worker learns that it lost a race.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Conflict { expected: JobState, actual: JobState },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// The shared job table, as required by the worker and the reconciliation poller.
///
/// Every state mutation goes through [`JobStore::change_state`]. Implementations must
/// evaluate the expected-state check and the write as one atomic operation.
pub trait JobStore {
    fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError>;

    fn get_job(&self, id: JobId) -> Result<JobRecord, StoreError>;

    /// Moves `id` to `new_state` and appends `message` to its log.
    ///
    /// With `expected = Some(prior)` the write happens only if the job is currently in
    /// `prior`, and the edge `prior -> new_state` must be part of the lifecycle graph.
    /// With `expected = None` the transition is forced (operator override). Entering
    /// ERROR discards any recorded output files.
    fn change_state(
        &mut self,
        id: JobId,
        new_state: JobState,
        message: &str,
        expected: Option<JobState>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Appends a note to the job log without changing state.
    fn add_log(&mut self, id: JobId, message: &str) -> Result<(), StoreError>;

    /// Replaces the job's output file list.
    fn set_output_files(&mut self, id: JobId, files: &[String]) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NoOutputFiles`] when nothing is recorded.
    fn get_output_files(&self, id: JobId) -> Result<Vec<String>, StoreError>;

    fn add_job(&mut self, job: NewJob) -> Result<JobId, StoreError>;

    fn get_input_files(&self, id: JobId) -> Result<Vec<String>, StoreError>;

    fn set_qa_state(&mut self, id: JobId, qa_state: QaState, message: &str)
    -> Result<(), StoreError>;

    /// Log entries oldest first.
    fn get_logs(&self, id: JobId) -> Result<Vec<LogEntry>, StoreError>;

    /// Log entries (newest first) of every job in ERROR at `location`.
    fn find_errors_logs(
        &self,
        location: &Location,
    ) -> Result<BTreeMap<JobId, Vec<LogEntry>>, StoreError>;
}
