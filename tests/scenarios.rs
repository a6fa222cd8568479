//! End-to-end coordinator scenarios against a real store, no containers.

use std::path::Path;
use std::sync::{Arc, Mutex};

use casebench::config::{OrchestratorConfig, ServicesConfig};
use casebench::events::{EventPublisher, JobEvent, PublishError};
use casebench::job::coordinator::{Collaborators, JobCoordinator};
use casebench::job::{CaseStatus, ExecutionJob, JobRequest, JobStatus};
use casebench::scheduler::StopFlags;
use casebench::services::ServiceClient;
use casebench::storage::evidence::collect_job_evidence;
use casebench::storage::Store;
use serde_json::json;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<JobEvent>>,
}

#[async_trait::async_trait]
impl EventPublisher for Recorder {
    async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl Recorder {
    fn case_statuses(&self) -> Vec<CaseStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                JobEvent::CaseCompleted { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn job_completed(&self) -> Vec<(JobStatus, usize)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                JobEvent::JobCompleted {
                    status, case_count, ..
                } => Some((*status, *case_count)),
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Store,
    recorder: Arc<Recorder>,
    deps: Collaborators,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("cases")).unwrap();
    std::fs::write(root.join("cases/three.csv"), "row,user\n1,ana\n2,bob\n3,cy\n").unwrap();

    let mut config = OrchestratorConfig::default();
    config.paths.database = root.join("casebench.db");
    config.paths.test_cases_dir = root.join("cases");
    config.paths.evidence_dir = root.join("evidence");

    let store = Store::open(&config.paths.database.to_string_lossy()).unwrap();
    let recorder = Arc::new(Recorder::default());
    let deps = Collaborators {
        config: Arc::new(config),
        store: store.clone(),
        provisioner: None,
        stop_flags: Arc::new(store.clone()),
        publisher: recorder.clone(),
        services: ServiceClient::new(ServicesConfig::default()).unwrap(),
    };
    Harness {
        _dir: dir,
        store,
        recorder,
        deps,
    }
}

fn job(id: &str, body: &str) -> ExecutionJob {
    let req: JobRequest = serde_json::from_value(json!({
        "execution_id": id,
        "body_script": body,
        "case_source": "three.csv",
        "concurrency": 2,
        "web": false,
    }))
    .unwrap();
    ExecutionJob::from_request(req, None).unwrap()
}

#[tokio::test]
async fn all_cases_pass() {
    let h = harness();
    let summary = JobCoordinator::new(job("ex-ok", "assert_that(true, \"always\")"), h.deps.clone())
        .run()
        .await;

    assert_eq!(summary.status, JobStatus::Succeeded);
    assert_eq!(h.recorder.case_statuses(), vec![CaseStatus::Succeeded; 3]);
    assert_eq!(h.recorder.job_completed(), vec![(JobStatus::Succeeded, 3)]);
    assert_eq!(h.store.status_for("ex-ok").unwrap().unwrap().status, "succeeded");
}

#[tokio::test]
async fn one_case_raises() {
    let h = harness();
    let body = "write_case_evidence(\"visit\", row.user)\nif row.row == 2 { undefined_call() }";
    let summary = JobCoordinator::new(job("ex-bad", body), h.deps.clone()).run().await;

    let statuses: Vec<_> = summary.cases.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![CaseStatus::Succeeded, CaseStatus::Failed, CaseStatus::Succeeded]
    );
    assert_eq!(summary.status, JobStatus::Failed);
    assert_eq!(h.recorder.job_completed(), vec![(JobStatus::Failed, 3)]);

    for case in &summary.cases {
        let artifact = case.evidence_dir.join("visit.txt");
        assert!(artifact.is_file(), "{} kept its evidence", case.case_id);
    }
}

#[tokio::test]
async fn stop_before_dispatch() {
    let h = harness();
    StopFlags::request_stop(&h.store, "ex-stop").unwrap();

    let summary = JobCoordinator::new(job("ex-stop", "log(row.user)"), h.deps.clone())
        .run()
        .await;

    assert!(summary.cases.is_empty());
    assert_eq!(summary.not_started, 3);
    assert!(h.recorder.case_statuses().is_empty());
    assert_eq!(h.recorder.job_completed(), vec![(JobStatus::Stopped, 0)]);
}

#[tokio::test]
async fn evidence_collection_is_repeatable() {
    let h = harness();
    let body = "write_job_evidence(\"summary\", \"case \" + row.row)";
    JobCoordinator::new(job("ex-ev", body), h.deps.clone()).run().await;

    let first = collect_job_evidence(&h.store, "ex-ev").unwrap();
    let before: Vec<Vec<u8>> = first.iter().map(|p| std::fs::read(p).unwrap()).collect();
    let second = collect_job_evidence(&h.store, "ex-ev").unwrap();
    let after: Vec<Vec<u8>> = second.iter().map(|p| std::fs::read(p).unwrap()).collect();

    assert_eq!(first, second);
    assert_eq!(before, after);
    assert_eq!(first.len(), 1);
    assert!(Path::new(&first[0]).ends_with("ex-ev/summary.txt"));
    assert_eq!(String::from_utf8_lossy(&before[0]).lines().count(), 3);
}
