#![forbid(unsafe_code)]

use jp_core::JobState;
use jp_core::ids::JobId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("no output files recorded for job {0}")]
    NoOutputFiles(JobId),
    #[error("transition {from} -> {to} is not part of the job lifecycle")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("a job with tag {0:?} already exists")]
    DuplicateTag(String),
    #[error("corrupt row for job {job_id}: {detail}")]
    CorruptRow { job_id: JobId, detail: String },
}
