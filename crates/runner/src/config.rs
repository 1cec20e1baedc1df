#![forbid(unsafe_code)]

use jp_core::ids::{JobId, Location};
use std::path::{Path, PathBuf};

pub const INPUT_MANIFEST_NAME: &str = "input_files_job.lis";

/// Settings shared by every command-line driver.
#[derive(Debug, Clone, clap::Args)]
pub struct ProcConfig {
    /// SQLite job database shared by all workers.
    #[arg(long, env = "JP_DATABASE", default_value = "jsa_proc/jobs.db")]
    pub database: PathBuf,

    /// Root of the per-job input/output/log directories.
    #[arg(long, env = "JP_SCRATCH_ROOT", default_value = "jsa_proc/scratch")]
    pub scratch_root: PathBuf,

    /// Processing site this process acts for.
    #[arg(long, env = "JP_LOCATION", default_value = "JAC")]
    pub location: Location,

    /// Name written into job logs (defaults to $HOSTNAME).
    #[arg(long, env = "JP_WORKER_ID")]
    pub worker_id: Option<String>,
}

impl ProcConfig {
    pub fn worker_id(&self) -> String {
        self.worker_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| {
                std::env::var("HOSTNAME")
                    .ok()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })
            .unwrap_or_else(|| format!("jp_runner:{}", std::process::id()))
    }

    pub fn directories(&self) -> Directories {
        Directories::new(&self.scratch_root)
    }
}

/// Per-job directory layout under the scratch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directories {
    root: PathBuf,
}

impl Directories {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join("input").join(job_id.to_string())
    }

    pub fn input_manifest(&self, job_id: JobId) -> PathBuf {
        self.input_dir(job_id).join(INPUT_MANIFEST_NAME)
    }

    pub fn output_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join("output").join(job_id.to_string())
    }

    pub fn log_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join("log").join(job_id.to_string())
    }

    pub fn pipeline_log(&self, job_id: JobId) -> PathBuf {
        self.log_dir(job_id).join("pipeline.log")
    }
}
