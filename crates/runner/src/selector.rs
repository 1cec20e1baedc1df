#![forbid(unsafe_code)]

use jp_core::JobState;
use jp_core::ids::Location;
use jp_core::model::JobRecord;
use jp_storage::{JobQuery, JobStore, StoreError};

/// Jobs at `location` in `state`, at most `limit` of them.
///
/// Prioritized selection orders by priority (highest first), then by job id. An empty
/// result means there is no work, not a failure.
pub fn select<S: JobStore + ?Sized>(
    store: &S,
    location: &Location,
    state: JobState,
    limit: usize,
    prioritized: bool,
) -> Result<Vec<JobRecord>, StoreError> {
    let mut query = JobQuery::in_state(state, location).limit(limit);
    if prioritized {
        query = query.prioritized();
    }
    store.find_jobs(&query)
}

/// The single job a worker should attempt next, if any.
pub fn next_waiting<S: JobStore + ?Sized>(
    store: &S,
    location: &Location,
) -> Result<Option<JobRecord>, StoreError> {
    Ok(select(store, location, JobState::Waiting, 1, true)?
        .into_iter()
        .next())
}
