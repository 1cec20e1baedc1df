#![forbid(unsafe_code)]

use crate::config::Directories;
use jp_core::JobState;
use jp_core::ids::{JobId, Location};
use jp_core::model::JobRecord;
use jp_storage::{JobQuery, JobStore, StoreError, TransitionOutcome};
use std::io::Write as _;
use std::path::{Path, PathBuf};

const POLLED_STATES: [JobState; 3] = [JobState::Queued, JobState::Missing, JobState::Transferring];
const MAX_NAMED_MISSING: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("job store: {0}")]
    Store(#[from] StoreError),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result of looking for a job's input files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputCheck {
    /// Every input was found; resolved paths in input order.
    Available(Vec<PathBuf>),
    /// Names of the inputs that could not be found, in input order.
    Missing(Vec<String>),
}

/// The outside world the poller reconciles job state against.
pub trait ExternalConditions {
    fn locate_inputs(&self, job: &JobRecord, inputs: &[String]) -> Result<InputCheck, PollError>;

    /// Whether the job's products have reached the archive.
    fn transfer_complete(&self, job: &JobRecord, outputs: &[String]) -> Result<bool, PollError>;
}

/// Looks for inputs under a list of data roots and for transferred outputs in an
/// archive staging directory.
#[derive(Clone, Debug, Default)]
pub struct FilesystemConditions {
    data_roots: Vec<PathBuf>,
    archive_dir: Option<PathBuf>,
}

impl FilesystemConditions {
    pub fn new(data_roots: Vec<PathBuf>, archive_dir: Option<PathBuf>) -> Self {
        Self {
            data_roots,
            archive_dir,
        }
    }
}

impl ExternalConditions for FilesystemConditions {
    fn locate_inputs(&self, _job: &JobRecord, inputs: &[String]) -> Result<InputCheck, PollError> {
        let mut found = Vec::with_capacity(inputs.len());
        let mut missing = Vec::new();
        for name in inputs {
            match self
                .data_roots
                .iter()
                .map(|root| root.join(name))
                .find(|candidate| candidate.is_file())
            {
                Some(path) => found.push(path),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(InputCheck::Available(found))
        } else {
            Ok(InputCheck::Missing(missing))
        }
    }

    fn transfer_complete(&self, _job: &JobRecord, outputs: &[String]) -> Result<bool, PollError> {
        let Some(archive_dir) = self.archive_dir.as_deref() else {
            return Ok(false);
        };
        Ok(!outputs.is_empty() && outputs.iter().all(|name| archive_dir.join(name).is_file()))
    }
}

/// Periodic sweep that advances jobs through the phases that need no pipeline run.
///
/// Every transition is conditional on the state the sweep observed, so running it
/// again (or concurrently) never repeats a side effect.
pub struct Poller<S, C> {
    store: S,
    conditions: C,
    dirs: Directories,
}

impl<S: JobStore, C: ExternalConditions> Poller<S, C> {
    pub fn new(store: S, conditions: C, dirs: Directories) -> Self {
        Self {
            store,
            conditions,
            dirs,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One sweep over `location`. `false` if any job (or any lookup) failed; the
    /// remaining jobs are still examined.
    pub fn poll(&mut self, location: &Location) -> bool {
        let mut ok = true;
        let mut jobs = Vec::new();
        for state in POLLED_STATES {
            match self.store.find_jobs(&JobQuery::in_state(state, location)) {
                Ok(found) => jobs.extend(found),
                Err(err) => {
                    tracing::error!(location = %location, state = %state, error = %err, "failed to list jobs");
                    ok = false;
                }
            }
        }
        tracing::debug!(location = %location, count = jobs.len(), "polling jobs");

        for job in &jobs {
            if let Err(err) = self.poll_job(job) {
                ok = false;
                tracing::error!(job_id = %job.id, state = %job.state, error = %err, "poll failed");
                if let Err(log_err) = self.store.add_log(job.id, &format!("Poll failure: {err}")) {
                    tracing::warn!(job_id = %job.id, error = %log_err, "could not record poll failure");
                }
            }
        }
        ok
    }

    fn poll_job(&mut self, job: &JobRecord) -> Result<(), PollError> {
        match job.state {
            JobState::Queued | JobState::Missing => self.check_inputs(job),
            JobState::Transferring => self.check_transfer(job),
            _ => Ok(()),
        }
    }

    fn check_inputs(&mut self, job: &JobRecord) -> Result<(), PollError> {
        let inputs = self.store.get_input_files(job.id)?;
        match self.conditions.locate_inputs(job, &inputs)? {
            InputCheck::Available(paths) => {
                write_manifest(&self.dirs, job.id, &paths)?;
                self.advance(job, JobState::Waiting, "Input files available")
            }
            InputCheck::Missing(names) if job.state == JobState::Queued => {
                let message = format!("Missing input files: {}", summarize(&names));
                self.advance(job, JobState::Missing, &message)
            }
            InputCheck::Missing(names) => {
                tracing::debug!(job_id = %job.id, missing = names.len(), "inputs still missing");
                Ok(())
            }
        }
    }

    fn check_transfer(&mut self, job: &JobRecord) -> Result<(), PollError> {
        let outputs = match self.store.get_output_files(job.id) {
            Ok(files) => files,
            // Nothing recorded means nothing can have reached the archive yet.
            Err(StoreError::NoOutputFiles(_)) => {
                tracing::debug!(job_id = %job.id, "no output files recorded; transfer pending");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if self.conditions.transfer_complete(job, &outputs)? {
            self.advance(job, JobState::Ingestion, "Output files transferred")
        } else {
            Ok(())
        }
    }

    fn advance(&mut self, job: &JobRecord, next: JobState, message: &str) -> Result<(), PollError> {
        match self.store.change_state(job.id, next, message, Some(job.state))? {
            TransitionOutcome::Applied => {
                tracing::info!(job_id = %job.id, from = %job.state, to = %next, "job advanced");
            }
            TransitionOutcome::Conflict { actual, .. } => {
                tracing::debug!(job_id = %job.id, state = %actual, "job already moved on");
            }
        }
        Ok(())
    }
}

fn summarize(names: &[String]) -> String {
    let shown = names
        .iter()
        .take(MAX_NAMED_MISSING)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > MAX_NAMED_MISSING {
        format!("{shown} (and {} more)", names.len() - MAX_NAMED_MISSING)
    } else {
        shown
    }
}

/// Writes the resolved input list (absolute paths, one per line) for the worker.
///
/// The list is written to a temporary file and renamed into place, so a worker never
/// sees a partial manifest.
pub fn write_manifest(dirs: &Directories, job_id: JobId, inputs: &[PathBuf]) -> Result<(), PollError> {
    let dir = dirs.input_dir(job_id);
    std::fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;

    let manifest = dirs.input_manifest(job_id);
    let tmp = manifest.with_extension("lis.tmp");
    let mut file = std::fs::File::create(&tmp).map_err(|source| io_error(&tmp, source))?;
    for input in inputs {
        let path = std::path::absolute(input).map_err(|source| io_error(input, source))?;
        writeln!(file, "{}", path.display()).map_err(|source| io_error(&tmp, source))?;
    }
    file.sync_all().map_err(|source| io_error(&tmp, source))?;
    drop(file);
    std::fs::rename(&tmp, &manifest).map_err(|source| io_error(&manifest, source))
}

fn io_error(path: &Path, source: std::io::Error) -> PollError {
    PollError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jp_core::model::NewJob;
    use jp_storage::SqliteStore;
    use std::collections::HashSet;

    struct FakeConditions {
        present: HashSet<String>,
        transferred: bool,
        broken_tag: Option<&'static str>,
    }

    impl FakeConditions {
        fn with(present: &[&str]) -> Self {
            Self {
                present: present.iter().map(|s| s.to_string()).collect(),
                transferred: false,
                broken_tag: None,
            }
        }
    }

    impl ExternalConditions for FakeConditions {
        fn locate_inputs(
            &self,
            job: &JobRecord,
            inputs: &[String],
        ) -> Result<InputCheck, PollError> {
            if self.broken_tag == Some(job.tag.as_str()) {
                return Err(PollError::Io {
                    path: PathBuf::from("/data"),
                    source: std::io::Error::other("mount unavailable"),
                });
            }
            let missing = inputs
                .iter()
                .filter(|name| !self.present.contains(*name))
                .cloned()
                .collect::<Vec<_>>();
            if missing.is_empty() {
                Ok(InputCheck::Available(
                    inputs.iter().map(|n| Path::new("/data").join(n)).collect(),
                ))
            } else {
                Ok(InputCheck::Missing(missing))
            }
        }

        fn transfer_complete(&self, _job: &JobRecord, _outputs: &[String]) -> Result<bool, PollError> {
            Ok(self.transferred)
        }
    }

    fn jac() -> Location {
        Location::try_new("JAC").expect("location")
    }

    fn add_job(store: &mut SqliteStore, tag: &str, inputs: &[&str]) -> JobId {
        store
            .add_job(NewJob {
                tag: tag.to_string(),
                location: jac(),
                mode: "night".to_string(),
                parameters: String::new(),
                priority: 0,
                input_files: inputs.iter().map(|s| s.to_string()).collect(),
            })
            .expect("add")
    }

    fn transition_count(store: &SqliteStore, id: JobId) -> usize {
        store
            .get_logs(id)
            .expect("logs")
            .iter()
            .filter(|e| e.is_transition())
            .count()
    }

    #[test]
    fn queued_job_with_inputs_gets_manifest_and_waits() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut store = SqliteStore::open_in_memory().expect("store");
        let id = add_job(&mut store, "ready", &["a.sdf", "b.sdf"]);
        let dirs = Directories::new(scratch.path());
        let mut poller = Poller::new(store, FakeConditions::with(&["a.sdf", "b.sdf"]), dirs.clone());

        assert!(poller.poll(&jac()));
        assert_eq!(poller.store().get_job(id).expect("job").state, JobState::Waiting);
        let manifest = std::fs::read_to_string(dirs.input_manifest(id)).expect("manifest");
        assert_eq!(manifest, "/data/a.sdf\n/data/b.sdf\n");
    }

    #[test]
    fn missing_inputs_are_named_and_second_poll_is_a_no_op() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut store = SqliteStore::open_in_memory().expect("store");
        let id = add_job(&mut store, "partial", &["a.sdf", "b.sdf"]);
        let mut poller = Poller::new(
            store,
            FakeConditions::with(&["a.sdf"]),
            Directories::new(scratch.path()),
        );

        assert!(poller.poll(&jac()));
        let job = poller.store().get_job(id).expect("job");
        assert_eq!(job.state, JobState::Missing);
        let last = poller.store().get_logs(id).expect("logs").pop().expect("entry");
        assert_eq!(last.message, "Missing input files: b.sdf");

        let logs_before = poller.store().get_logs(id).expect("logs");
        assert!(poller.poll(&jac()));
        assert_eq!(poller.store().get_logs(id).expect("logs"), logs_before);
    }

    #[test]
    fn repeated_sweeps_add_no_transitions() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut store = SqliteStore::open_in_memory().expect("store");
        let ready = add_job(&mut store, "ready", &["a.sdf"]);
        let blocked = add_job(&mut store, "blocked", &["zzz.sdf"]);
        let mut poller = Poller::new(
            store,
            FakeConditions::with(&["a.sdf"]),
            Directories::new(scratch.path()),
        );

        assert!(poller.poll(&jac()));
        let after_first = (
            transition_count(poller.store(), ready),
            transition_count(poller.store(), blocked),
        );
        assert!(poller.poll(&jac()));
        let after_second = (
            transition_count(poller.store(), ready),
            transition_count(poller.store(), blocked),
        );
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn one_failing_job_does_not_stop_the_sweep() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut store = SqliteStore::open_in_memory().expect("store");
        let broken = add_job(&mut store, "broken", &["a.sdf"]);
        let healthy = add_job(&mut store, "healthy", &["a.sdf"]);
        let mut conditions = FakeConditions::with(&["a.sdf"]);
        conditions.broken_tag = Some("broken");
        let mut poller = Poller::new(store, conditions, Directories::new(scratch.path()));

        assert!(!poller.poll(&jac()));
        assert_eq!(
            poller.store().get_job(broken).expect("job").state,
            JobState::Queued
        );
        let note = poller.store().get_logs(broken).expect("logs").pop().expect("entry");
        assert!(note.message.starts_with("Poll failure: "));
        assert!(note.message.contains("mount unavailable"));
        assert_eq!(
            poller.store().get_job(healthy).expect("job").state,
            JobState::Waiting
        );
    }

    #[test]
    fn transferred_outputs_move_job_to_ingestion() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut store = SqliteStore::open_in_memory().expect("store");
        let id = add_job(&mut store, "products", &[]);
        let _ = store
            .change_state(id, JobState::Transferring, "setup", None)
            .expect("setup");
        store
            .set_output_files(id, &["out_reduced.sdf".to_string()])
            .expect("outputs");
        let mut conditions = FakeConditions::with(&[]);
        conditions.transferred = true;
        let mut poller = Poller::new(store, conditions, Directories::new(scratch.path()));

        assert!(poller.poll(&jac()));
        let last = poller.store().get_logs(id).expect("logs").pop().expect("entry");
        assert_eq!(last.state_prev, JobState::Transferring);
        assert_eq!(last.state_new, JobState::Ingestion);
    }

    #[test]
    fn transferring_job_without_outputs_stays_put() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let archive = scratch.path().join("archive");
        std::fs::create_dir_all(&archive).expect("mkdir");
        let mut store = SqliteStore::open_in_memory().expect("store");
        let id = add_job(&mut store, "nothing_sent", &[]);
        let _ = store
            .change_state(id, JobState::Transferring, "setup", None)
            .expect("setup");
        let logs_before = store.get_logs(id).expect("logs");
        let mut poller = Poller::new(
            store,
            FilesystemConditions::new(Vec::new(), Some(archive)),
            Directories::new(scratch.path().join("scratch")),
        );

        assert!(poller.poll(&jac()));
        assert_eq!(
            poller.store().get_job(id).expect("job").state,
            JobState::Transferring
        );
        assert_eq!(poller.store().get_logs(id).expect("logs"), logs_before);
    }

    #[test]
    fn filesystem_conditions_search_roots_in_order() {
        let roots = tempfile::tempdir().expect("tempdir");
        let first = roots.path().join("first");
        let second = roots.path().join("second");
        std::fs::create_dir_all(&first).expect("mkdir");
        std::fs::create_dir_all(&second).expect("mkdir");
        std::fs::write(second.join("a.sdf"), b"a").expect("write");
        std::fs::write(first.join("b.sdf"), b"b").expect("write");
        std::fs::write(second.join("b.sdf"), b"b").expect("write");

        let archive = roots.path().join("archive");
        std::fs::create_dir_all(&archive).expect("mkdir");
        std::fs::write(archive.join("out.sdf"), b"o").expect("write");

        let conditions =
            FilesystemConditions::new(vec![first.clone(), second.clone()], Some(archive));
        let job = JobRecord {
            id: JobId::new(1),
            tag: "fs".to_string(),
            state: JobState::Queued,
            qa_state: jp_core::QaState::Unknown,
            location: jac(),
            mode: "night".to_string(),
            parameters: String::new(),
            priority: 0,
            created_at_ms: 0,
            updated_at_ms: 0,
        };

        let inputs = vec!["a.sdf".to_string(), "b.sdf".to_string()];
        assert_eq!(
            conditions.locate_inputs(&job, &inputs).expect("locate"),
            InputCheck::Available(vec![second.join("a.sdf"), first.join("b.sdf")])
        );
        let inputs = vec!["a.sdf".to_string(), "c.sdf".to_string()];
        assert_eq!(
            conditions.locate_inputs(&job, &inputs).expect("locate"),
            InputCheck::Missing(vec!["c.sdf".to_string()])
        );

        assert!(
            conditions
                .transfer_complete(&job, &["out.sdf".to_string()])
                .expect("check")
        );
        assert!(
            !conditions
                .transfer_complete(&job, &["out.sdf".to_string(), "other.sdf".to_string()])
                .expect("check")
        );
        assert!(
            !conditions.transfer_complete(&job, &[]).expect("check"),
            "an empty product list is never transferred"
        );
        assert!(
            !FilesystemConditions::new(Vec::new(), None)
                .transfer_complete(&job, &[])
                .expect("check")
        );
    }

    #[test]
    fn summary_caps_named_files() {
        let names = (0..7).map(|n| format!("f{n}.sdf")).collect::<Vec<_>>();
        assert_eq!(
            summarize(&names),
            "f0.sdf, f1.sdf, f2.sdf, f3.sdf, f4.sdf (and 2 more)"
        );
    }
}
