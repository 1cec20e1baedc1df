#![forbid(unsafe_code)]

use jp_core::ids::Location;
use jp_core::{JobState, QaState};

/// Filter for [`crate::JobStore::find_jobs`].
///
/// `prioritize` orders by priority (highest first) with the job id as tie-breaker;
/// `sort` alone orders by job id. Without either the order is unspecified.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct JobQuery {
    pub state: Option<JobState>,
    pub location: Option<Location>,
    pub qa_state: Option<QaState>,
    pub prioritize: bool,
    pub sort: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobQuery {
    pub fn in_state(state: JobState, location: &Location) -> Self {
        Self {
            state: Some(state),
            location: Some(location.clone()),
            sort: true,
            ..Self::default()
        }
    }

    pub fn prioritized(mut self) -> Self {
        self.prioritize = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
