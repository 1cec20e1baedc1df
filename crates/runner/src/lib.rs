#![forbid(unsafe_code)]

pub mod config;
pub mod containment;
mod logging;
pub mod pipeline;
pub mod poller;
pub mod selector;
pub mod worker;

pub use config::{Directories, INPUT_MANIFEST_NAME, ProcConfig};
pub use containment::{FailureCategory, JobOutcome, RunError, RunOutcome, contain};
pub use logging::init_logging;
pub use pipeline::{CommandPipeline, Pipeline, PipelineError, PipelineRequest};
pub use poller::{ExternalConditions, FilesystemConditions, InputCheck, PollError, Poller};
pub use worker::{ClaimMode, Worker};
