#![forbid(unsafe_code)]

use jp_core::ids::{JobId, Location};
use jp_core::model::NewJob;
use jp_core::{JobState, QaState};
use jp_storage::{JobQuery, JobStore, SqliteStore, StoreError, TransitionOutcome};
use std::path::Path;
use std::sync::{Arc, Barrier};

fn jac() -> Location {
    Location::try_new("JAC").expect("location")
}

fn new_job(tag: &str, priority: i64) -> NewJob {
    NewJob {
        tag: tag.to_string(),
        location: jac(),
        mode: "night".to_string(),
        parameters: "REDUCE_SCAN_JSA_PUBLIC".to_string(),
        priority,
        input_files: vec![format!("{tag}_0001.sdf"), format!("{tag}_0002.sdf")],
    }
}

fn open(dir: &Path) -> SqliteStore {
    SqliteStore::open(dir.join("jobs.db"))
        .expect("open store")
        .with_host("testhost")
        .expect("host")
}

fn waiting_job(store: &mut SqliteStore, tag: &str) -> JobId {
    let id = store.add_job(new_job(tag, 0)).expect("add job");
    let outcome = store
        .change_state(id, JobState::Waiting, "inputs ready", Some(JobState::Queued))
        .expect("queue -> waiting");
    assert_eq!(outcome, TransitionOutcome::Applied);
    id
}

#[test]
fn add_job_records_inputs_and_creation_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());

    let id = store.add_job(new_job("scan_a", 5)).expect("add job");
    let job = store.get_job(id).expect("get job");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.qa_state, QaState::Unknown);
    assert_eq!(job.location, jac());
    assert_eq!(job.priority, 5);
    assert_eq!(job.mode, "night");

    assert_eq!(
        store.get_input_files(id).expect("inputs"),
        vec!["scan_a_0001.sdf".to_string(), "scan_a_0002.sdf".to_string()]
    );

    let logs = store.get_logs(id).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].state_prev, JobState::Unknown);
    assert_eq!(logs[0].state_new, JobState::Queued);
    assert_eq!(logs[0].host, "testhost");

    let err = store.add_job(new_job("scan_a", 1)).expect_err("duplicate tag");
    assert!(matches!(err, StoreError::DuplicateTag(tag) if tag == "scan_a"));
}

#[test]
fn find_jobs_orders_by_priority_then_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());

    let low = store.add_job(new_job("low", 1)).expect("low");
    let high_a = store.add_job(new_job("high_a", 10)).expect("high_a");
    let high_b = store.add_job(new_job("high_b", 10)).expect("high_b");
    let mut cadc = new_job("elsewhere", 100);
    cadc.location = Location::try_new("CADC").expect("location");
    store.add_job(cadc).expect("cadc job");

    let found = store
        .find_jobs(&JobQuery::in_state(JobState::Queued, &jac()).prioritized())
        .expect("find");
    let ids = found.iter().map(|j| j.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![high_a, high_b, low]);

    let first = store
        .find_jobs(&JobQuery::in_state(JobState::Queued, &jac()).prioritized().limit(1))
        .expect("find limited");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, high_a);

    let none = store
        .find_jobs(&JobQuery::in_state(JobState::Waiting, &jac()))
        .expect("find waiting");
    assert!(none.is_empty());
}

#[test]
fn conditional_transition_conflict_leaves_job_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let id = waiting_job(&mut store, "conflict");

    let claimed = store
        .change_state(id, JobState::Running, "claim one", Some(JobState::Waiting))
        .expect("first claim");
    assert!(claimed.is_applied());

    let before = store.get_job(id).expect("job");
    let logs_before = store.get_logs(id).expect("logs").len();

    let second = store
        .change_state(id, JobState::Running, "claim two", Some(JobState::Waiting))
        .expect("second claim evaluates");
    assert_eq!(
        second,
        TransitionOutcome::Conflict {
            expected: JobState::Waiting,
            actual: JobState::Running,
        }
    );
    assert_eq!(store.get_job(id).expect("job"), before);
    assert_eq!(store.get_logs(id).expect("logs").len(), logs_before);
}

#[test]
fn every_transition_appends_one_log_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let id = waiting_job(&mut store, "logged");

    let _ = store
        .change_state(id, JobState::Running, "running now", Some(JobState::Waiting))
        .expect("claim");
    let logs = store.get_logs(id).expect("logs");
    assert_eq!(logs.len(), 3);
    let last = logs.last().expect("last entry");
    assert_eq!(last.state_prev, JobState::Waiting);
    assert_eq!(last.state_new, JobState::Running);
    assert_eq!(last.message, "running now");
    assert!(last.is_transition());
}

#[test]
fn conditional_transition_must_follow_lifecycle_graph() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let id = store.add_job(new_job("graph", 0)).expect("add job");

    let err = store
        .change_state(id, JobState::Processed, "skip ahead", Some(JobState::Queued))
        .expect_err("queued -> processed is not an edge");
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: JobState::Queued,
            to: JobState::Processed
        }
    ));
    assert_eq!(store.get_job(id).expect("job").state, JobState::Queued);
}

#[test]
fn forced_transition_ignores_current_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let id = store.add_job(new_job("forced", 0)).expect("add job");

    let outcome = store
        .change_state(id, JobState::Running, "operator override", None)
        .expect("forced");
    assert_eq!(outcome, TransitionOutcome::Applied);
    let outcome = store
        .change_state(id, JobState::Deleted, "operator delete", None)
        .expect("forced delete");
    assert_eq!(outcome, TransitionOutcome::Applied);
    assert_eq!(store.get_job(id).expect("job").state, JobState::Deleted);

    let logs = store.get_logs(id).expect("logs");
    let last = logs.last().expect("last");
    assert_eq!(last.state_prev, JobState::Running);
    assert_eq!(last.state_new, JobState::Deleted);
}

#[test]
fn unknown_job_is_an_error_not_a_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let missing = JobId::new(999);

    let err = store
        .change_state(missing, JobState::Running, "claim", Some(JobState::Waiting))
        .expect_err("unknown id");
    assert!(matches!(err, StoreError::UnknownJob(id) if id == missing));
    assert!(matches!(
        store.get_job(missing),
        Err(StoreError::UnknownJob(_))
    ));
}

#[test]
fn output_files_round_trip_and_are_cleared_on_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let id = waiting_job(&mut store, "outputs");

    assert!(matches!(
        store.get_output_files(id),
        Err(StoreError::NoOutputFiles(_))
    ));

    let files = vec![
        "jcmts20140101_00001_850_reduced001.sdf".to_string(),
        "jcmts20140101_00001_850_preview_256.png".to_string(),
    ];
    store.set_output_files(id, &files).expect("set outputs");
    assert_eq!(store.get_output_files(id).expect("outputs"), files);

    store
        .set_output_files(id, &files[..1])
        .expect("overwrite outputs");
    assert_eq!(store.get_output_files(id).expect("outputs"), files[..1].to_vec());

    let _ = store
        .change_state(id, JobState::Error, "broke", None)
        .expect("to error");
    assert!(matches!(
        store.get_output_files(id),
        Err(StoreError::NoOutputFiles(_))
    ));
}

#[test]
fn qa_state_changes_without_touching_lifecycle_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let id = waiting_job(&mut store, "qa");

    store
        .set_qa_state(id, QaState::Questionable, "noisy map")
        .expect("set qa");
    let job = store.get_job(id).expect("job");
    assert_eq!(job.qa_state, QaState::Questionable);
    assert_eq!(job.state, JobState::Waiting);

    let last = store.get_logs(id).expect("logs").pop().expect("entry");
    assert!(!last.is_transition());
    assert!(last.message.contains("QUESTIONABLE"));

    let questionable = store
        .find_jobs(&JobQuery {
            qa_state: Some(QaState::Questionable),
            ..JobQuery::default()
        })
        .expect("find by qa");
    assert_eq!(questionable.len(), 1);
}

#[test]
fn error_logs_are_grouped_by_job_newest_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = open(dir.path());
    let broken = waiting_job(&mut store, "broken");
    let healthy = waiting_job(&mut store, "healthy");

    store
        .add_log(broken, "ExecutionFailure: pipeline exited with 1")
        .expect("note");
    let _ = store
        .change_state(broken, JobState::Error, "Error: pipeline exited with 1", None)
        .expect("to error");

    let errors = store.find_errors_logs(&jac()).expect("errors");
    assert_eq!(errors.keys().copied().collect::<Vec<_>>(), vec![broken]);
    assert!(!errors.contains_key(&healthy));
    let entries = &errors[&broken];
    assert_eq!(entries[0].state_new, JobState::Error);
    assert!(entries[0].id > entries[1].id);

    let cadc = Location::try_new("CADC").expect("location");
    assert!(store.find_errors_logs(&cadc).expect("errors").is_empty());
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    const WORKERS: usize = 4;
    const JOBS: usize = 8;

    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("jobs.db");
    let mut setup = SqliteStore::open(&db_path).expect("open store");
    let ids = (0..JOBS)
        .map(|n| waiting_job(&mut setup, &format!("race_{n}")))
        .collect::<Vec<_>>();
    drop(setup);

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles = (0..WORKERS)
        .map(|worker| {
            let db_path = db_path.clone();
            let ids = ids.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut store = SqliteStore::open(&db_path)
                    .expect("open store")
                    .with_host(format!("worker{worker}"))
                    .expect("host");
                barrier.wait();
                ids.iter()
                    .filter(|id| {
                        store
                            .change_state(
                                **id,
                                JobState::Running,
                                "Job is about to be run",
                                Some(JobState::Waiting),
                            )
                            .expect("claim evaluates")
                            .is_applied()
                    })
                    .count()
            })
        })
        .collect::<Vec<_>>();

    let wins: usize = handles
        .into_iter()
        .map(|h| h.join().expect("worker thread"))
        .sum();
    assert_eq!(wins, JOBS, "every job claimed exactly once");

    let store = SqliteStore::open(&db_path).expect("reopen");
    for id in ids {
        assert_eq!(store.get_job(id).expect("job").state, JobState::Running);
        let claims = store
            .get_logs(id)
            .expect("logs")
            .into_iter()
            .filter(|e| e.state_new == JobState::Running)
            .count();
        assert_eq!(claims, 1, "job {id} has a single claim entry");
    }
}
