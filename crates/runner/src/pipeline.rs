#![forbid(unsafe_code)]

use jp_core::ids::JobId;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

const SNIPPET_HEAD_CHARS: usize = 300;
const SNIPPET_TAIL_CHARS: usize = 600;

/// Everything the reduction pipeline needs to process one claimed job.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest<'a> {
    pub job_id: JobId,
    pub manifest: &'a Path,
    pub mode: &'a str,
    pub parameters: &'a str,
    pub output_dir: &'a Path,
    pub log_path: &'a Path,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to prepare {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with status {status}: {snippet}")]
    ExitStatus {
        program: String,
        status: String,
        snippet: String,
    },
}

/// The external data-reduction step. Blocks until the run finishes.
pub trait Pipeline {
    fn run(&mut self, request: &PipelineRequest<'_>) -> Result<(), PipelineError>;
}

/// Runs the reduction wrapper as a child process, capturing its console output in the
/// per-job log file.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: String,
    cleanup: String,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, cleanup: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            cleanup: cleanup.into(),
        }
    }

    fn command(&self, request: &PipelineRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("--inputs={}", request.manifest.display()))
            .arg(format!("--id=jsa-proc-{}", request.job_id))
            .arg(format!("--mode={}", request.mode))
            .arg(format!("--transdir={}", request.output_dir.display()))
            .arg(format!("--cleanup={}", self.cleanup));
        if !request.parameters.trim().is_empty() {
            cmd.arg(format!("--drparameters={}", request.parameters.trim()));
        }
        cmd
    }
}

impl Pipeline for CommandPipeline {
    fn run(&mut self, request: &PipelineRequest<'_>) -> Result<(), PipelineError> {
        create_dir(request.output_dir)?;
        if let Some(parent) = request.log_path.parent() {
            create_dir(parent)?;
        }
        let prepare = |source| PipelineError::Prepare {
            path: request.log_path.to_path_buf(),
            source,
        };
        let stdout = File::create(request.log_path).map_err(prepare)?;
        let stderr = stdout.try_clone().map_err(prepare)?;

        tracing::info!(
            job_id = %request.job_id,
            program = %self.program,
            mode = request.mode,
            log = %request.log_path.display(),
            "starting reduction pipeline"
        );
        let status = self
            .command(request)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .map_err(|source| PipelineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(PipelineError::ExitStatus {
                program: self.program.clone(),
                status: format_exit_status(&status),
                snippet: read_log_snippet(request.log_path, SNIPPET_HEAD_CHARS, SNIPPET_TAIL_CHARS),
            });
        }
        tracing::debug!(job_id = %request.job_id, "reduction pipeline finished");
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(path).map_err(|source| PipelineError::Prepare {
        path: path.to_path_buf(),
        source,
    })
}

fn format_exit_status(status: &ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn sanitize_single_line(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Head and tail of the captured console output, flattened to one line.
pub(crate) fn read_log_snippet(log_path: &Path, head_chars: usize, tail_chars: usize) -> String {
    let raw = match std::fs::read(log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => return "-".to_string(),
    };
    let sanitized = sanitize_single_line(&raw);
    if sanitized.is_empty() || (head_chars == 0 && tail_chars == 0) {
        return "-".to_string();
    }
    let total = sanitized.chars().count();
    if total <= head_chars.saturating_add(tail_chars).saturating_add(3) {
        return sanitized;
    }
    let head = sanitized.chars().take(head_chars).collect::<String>();
    let tail = sanitized
        .chars()
        .skip(total.saturating_sub(tail_chars))
        .collect::<String>();
    format!("{head} … {tail}")
}

/// Names of the regular files a successful run left in `output_dir`, sorted.
///
/// A run that produced nothing (no directory) yields an empty list.
pub fn collect_output_files(output_dir: &Path) -> std::io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        files.push(entry.file_name().to_string_lossy().into_owned());
    }
    files.sort();
    Ok(files)
}
