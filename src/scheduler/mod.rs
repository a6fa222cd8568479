//! Case scheduler: fans a job's rows out over a bounded worker pool.

pub mod cancel;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::browser::SessionPool;
use crate::events::{EventPublisher, JobEvent};
use crate::job::{new_case_id, CaseRecord, CaseStatus, FailureSource};
use crate::sandbox::{execute_in_sandbox, CaseContext, ScriptSandbox};

pub use self::cancel::{CancellationToken, StopFlags};

/// What a scheduling run produced.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// One record per case that started, ordered by row.
    pub records: Vec<CaseRecord>,
    /// Rows never started because a stop was observed.
    pub not_started: usize,
    pub stop_observed: bool,
}

impl ScheduleOutcome {
    pub fn any_failed(&self) -> bool {
        self.records.iter().any(|r| r.status == CaseStatus::Failed)
    }
}

pub struct CaseScheduler {
    concurrency: usize,
    sandbox: ScriptSandbox,
    sessions: SessionPool,
    publisher: Arc<dyn EventPublisher>,
    token: Arc<CancellationToken>,
}

struct Shared {
    queue: Mutex<VecDeque<(usize, Map<String, Value>)>>,
    halted: AtomicBool,
    body: String,
    sandbox: ScriptSandbox,
    sessions: SessionPool,
    publisher: Arc<dyn EventPublisher>,
    token: Arc<CancellationToken>,
}

impl CaseScheduler {
    pub fn new(
        concurrency: usize,
        sandbox: ScriptSandbox,
        sessions: SessionPool,
        publisher: Arc<dyn EventPublisher>,
        token: Arc<CancellationToken>,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            sandbox,
            sessions,
            publisher,
            token,
        }
    }

    /// Run `body_script` once per row and wait for the pool to drain.
    ///
    /// The stop flag is checked before each case starts. Once it is seen no
    /// further case starts; cases already running finish normally.
    pub async fn run_all(&self, rows: Vec<Map<String, Value>>, body_script: &str) -> ScheduleOutcome {
        let total = rows.len();
        let workers = self.concurrency.min(total);
        let job_id = self.sandbox.job_id().to_string();
        info!(job_id = %job_id, cases = total, workers, "dispatching cases");

        let shared = Arc::new(Shared {
            queue: Mutex::new(rows.into_iter().enumerate().collect()),
            halted: AtomicBool::new(false),
            body: body_script.to_string(),
            sandbox: self.sandbox.clone(),
            sessions: self.sessions.clone(),
            publisher: self.publisher.clone(),
            token: self.token.clone(),
        });

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            pool.spawn(run_worker(shared.clone(), worker));
        }

        let mut records = Vec::with_capacity(total);
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(done) => records.extend(done),
                Err(e) => error!(job_id = %job_id, error = %e, "case worker aborted"),
            }
        }
        records.sort_by_key(|r| r.row_index);

        let outcome = ScheduleOutcome {
            not_started: total - records.len(),
            stop_observed: self.token.observed(),
            records,
        };
        info!(
            job_id = %job_id,
            started = outcome.records.len(),
            not_started = outcome.not_started,
            stopped = outcome.stop_observed,
            "case pool drained"
        );
        outcome
    }
}

async fn run_worker(shared: Arc<Shared>, worker: usize) -> Vec<CaseRecord> {
    let mut done = Vec::new();
    loop {
        if shared.halted.load(Ordering::SeqCst) {
            break;
        }
        let next = shared.queue.lock().ok().and_then(|mut q| q.pop_front());
        let Some((row_index, row)) = next else {
            break;
        };
        if shared.token.is_stopped() {
            shared.halted.store(true, Ordering::SeqCst);
            break;
        }

        let record = run_case(&shared, row_index, row).await;
        let event = JobEvent::CaseCompleted {
            case_id: record.case_id.clone(),
            job_id: record.job_id.clone(),
            status: record.status,
            evidence_dir: record.evidence_dir.clone(),
            error: record.error.clone(),
        };
        if let Err(e) = shared.publisher.publish(&event).await {
            warn!(case_id = %record.case_id, error = %e, "failed to publish case result");
        }
        done.push(record);
    }
    debug!(worker, cases = done.len(), "worker finished");
    done
}

async fn run_case(shared: &Shared, row_index: usize, row: Map<String, Value>) -> CaseRecord {
    let job_id = shared.sandbox.job_id().to_string();
    let case_id = new_case_id();
    let evidence_dir = shared.sandbox.evidence_root().join(&case_id);
    let mut record = CaseRecord::new(case_id.clone(), job_id, row_index, evidence_dir.clone());

    if let Err(e) = tokio::fs::create_dir_all(&evidence_dir).await {
        warn!(case_id = %case_id, path = %evidence_dir.display(), error = %e, "failed to create case evidence dir");
    }

    let lease = shared.sessions.acquire().await;
    let session = lease.as_ref().and_then(|l| l.session());
    let mut table = shared.sandbox.bind(CaseContext {
        case_id: case_id.clone(),
        row,
        session,
        evidence_dir,
    });

    debug!(case_id = %case_id, row = row_index, "case started");
    match execute_in_sandbox(&shared.body, &mut table).await {
        Ok(()) => record.succeed(),
        Err(fault) => {
            let source = if fault.is_assertion() {
                FailureSource::Assertion
            } else {
                FailureSource::Script
            };
            warn!(case_id = %case_id, row = row_index, error = %fault, "case failed");
            record.fail(source, fault.to_string());
        }
    }
    drop(lease);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServicesConfig;
    use crate::credentials::CredentialSet;
    use crate::events::testing::RecordingPublisher;
    use crate::sandbox::SandboxContext;
    use crate::services::ServiceClient;
    use crate::storage::testing::temp_store;
    use crate::storage::Store;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Reports stopped from the `after`-th check on.
    struct StopAfter {
        after: usize,
        checks: AtomicUsize,
    }

    impl StopFlags for StopAfter {
        fn is_stopped(&self, _job_id: &str) -> anyhow::Result<bool> {
            Ok(self.checks.fetch_add(1, Ordering::SeqCst) >= self.after)
        }

        fn request_stop(&self, _job_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn sandbox(store: Store, root: &Path) -> ScriptSandbox {
        ScriptSandbox::new(SandboxContext {
            job_id: "ex-1".into(),
            store,
            services: ServiceClient::new(ServicesConfig::default()).unwrap(),
            credentials: Arc::new(CredentialSet::empty()),
            evidence_root: root.join("ex-1"),
            highlight: Duration::from_millis(1),
            element_poll: Duration::from_millis(1),
        })
    }

    fn rows(n: usize) -> Vec<Map<String, Value>> {
        (0..n)
            .map(|i| json!({ "n": i }).as_object().unwrap().clone())
            .collect()
    }

    fn scheduler(
        store: Store,
        root: &Path,
        concurrency: usize,
        flags: Arc<dyn StopFlags>,
        publisher: Arc<RecordingPublisher>,
    ) -> CaseScheduler {
        CaseScheduler::new(
            concurrency,
            sandbox(store, root),
            SessionPool::empty(),
            publisher,
            Arc::new(CancellationToken::new("ex-1", flags)),
        )
    }

    #[tokio::test]
    async fn test_every_row_gets_a_record() {
        let (dir, store) = temp_store();
        let publisher = Arc::new(RecordingPublisher::default());
        let sched = scheduler(store.clone(), dir.path(), 3, Arc::new(store), publisher.clone());

        let outcome = sched
            .run_all(rows(7), "write_case_evidence(\"n\", row.n)")
            .await;

        assert_eq!(outcome.records.len(), 7);
        assert_eq!(outcome.not_started, 0);
        assert!(!outcome.any_failed());
        let indexes: Vec<_> = outcome.records.iter().map(|r| r.row_index).collect();
        assert_eq!(indexes, (0..7).collect::<Vec<_>>());
        assert!(outcome.records.iter().all(|r| r.evidence_dir.is_dir()));
        assert_eq!(publisher.events().len(), 7);
    }

    #[tokio::test]
    async fn test_failing_case_leaves_siblings_alone() {
        let (dir, store) = temp_store();
        let publisher = Arc::new(RecordingPublisher::default());
        let sched = scheduler(store.clone(), dir.path(), 2, Arc::new(store.clone()), publisher);

        let script = "write_case_evidence(\"trace\", row.n)\nif row.n == 1 { explode() }\nassert_that(row.n != 2, \"row two rejected\")";
        let outcome = sched.run_all(rows(4), script).await;

        let status: Vec<_> = outcome.records.iter().map(|r| r.status).collect();
        assert_eq!(
            status,
            vec![CaseStatus::Succeeded, CaseStatus::Failed, CaseStatus::Failed, CaseStatus::Succeeded]
        );
        assert_eq!(outcome.records[1].error.as_ref().unwrap().source, FailureSource::Script);
        assert_eq!(outcome.records[2].error.as_ref().unwrap().source, FailureSource::Assertion);

        let case_files = store
            .evidence_for_job("ex-1")
            .unwrap()
            .into_iter()
            .filter(|f| f.case_id.is_some())
            .count();
        assert_eq!(case_files, 4, "every case kept its own evidence");
    }

    #[tokio::test]
    async fn test_no_case_starts_after_stop_is_seen() {
        let (dir, store) = temp_store();
        let publisher = Arc::new(RecordingPublisher::default());
        let flags = Arc::new(StopAfter {
            after: 4,
            checks: AtomicUsize::new(0),
        });
        let sched = scheduler(store, dir.path(), 3, flags, publisher.clone());

        let outcome = sched.run_all(rows(10), "sleep(0.01)").await;

        assert!(outcome.stop_observed);
        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.not_started, 6);
        assert!(outcome.records.iter().all(|r| r.status == CaseStatus::Succeeded));
        assert_eq!(publisher.events().len(), 4);
    }

    #[tokio::test]
    async fn test_stop_before_dispatch_runs_nothing() {
        let (dir, store) = temp_store();
        StopFlags::request_stop(&store, "ex-1").unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let sched = scheduler(store.clone(), dir.path(), 2, Arc::new(store), publisher.clone());

        let outcome = sched.run_all(rows(3), "log(row.n)").await;
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.not_started, 3);
        assert!(publisher.events().is_empty());
    }
}
