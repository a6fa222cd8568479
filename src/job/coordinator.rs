//! Drives one job from provisioning to its final status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::cases::{load_rows, resolve_case_source};
use super::{new_case_id, CaseRecord, ExecutionJob, JobStatus};
use crate::browser::SessionPool;
use crate::config::OrchestratorConfig;
use crate::credentials::CredentialSet;
use crate::environment::{ContainerProvisioner, Environment};
use crate::events::{EventPublisher, JobEvent};
use crate::retry::retry;
use crate::sandbox::{execute_in_sandbox, CaseContext, SandboxContext, ScriptSandbox};
use crate::scheduler::{CancellationToken, CaseScheduler, ScheduleOutcome, StopFlags};
use crate::services::ServiceClient;
use crate::storage::evidence::collect_job_evidence;
use crate::storage::Store;

/// Attempts for the final status write and the job-completed publish.
const FINAL_ATTEMPTS: u32 = 2;
const FINAL_BACKOFF: Duration = Duration::from_millis(500);

/// Coordinator phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Provisioning,
    RunningSetup,
    RunningCases,
    RunningTeardown,
    CollectingEvidence,
    Cleanup,
}

/// Everything a coordinator talks to outside its own job.
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<OrchestratorConfig>,
    pub store: Store,
    /// Required for web-mode jobs.
    pub provisioner: Option<Arc<ContainerProvisioner>>,
    pub stop_flags: Arc<dyn StopFlags>,
    pub publisher: Arc<dyn EventPublisher>,
    pub services: ServiceClient,
}

/// Outcome of a finished job.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub cases: Vec<CaseRecord>,
    pub not_started: usize,
    /// Errors raised outside of individual cases.
    pub failures: Vec<String>,
}

/// Stopped wins over failed; anything else is a success.
pub fn final_status(stop_observed: bool, any_failure: bool) -> JobStatus {
    if stop_observed {
        JobStatus::Stopped
    } else if any_failure {
        JobStatus::Failed
    } else {
        JobStatus::Succeeded
    }
}

pub struct JobCoordinator {
    job: ExecutionJob,
    deps: Collaborators,
    phase: Phase,
    failures: Vec<String>,
}

impl JobCoordinator {
    pub fn new(job: ExecutionJob, deps: Collaborators) -> Self {
        Self {
            job,
            deps,
            phase: Phase::Pending,
            failures: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        info!(job_id = %self.job.id, from = ?self.phase, to = ?phase, "job phase");
        self.phase = phase;
    }

    fn fail(&mut self, message: String) {
        error!(job_id = %self.job.id, phase = ?self.phase, error = %message, "job step failed");
        self.failures.push(message);
    }

    /// Run the job to completion. Cleanup and the final status publish
    /// happen on every path.
    pub async fn run(mut self) -> JobSummary {
        self.job.status = JobStatus::Running;
        if let Err(e) = self.deps.store.record_status(&self.job.id, JobStatus::Running, None) {
            warn!(job_id = %self.job.id, error = %e, "failed to record job start");
        }
        info!(job_id = %self.job.id, web = self.job.web, concurrency = self.job.concurrency, "job started");

        let rows = self.load_cases();
        let environment = match rows {
            Some(_) if self.job.web => self.provision().await,
            _ => None,
        };

        let mut outcome = ScheduleOutcome::default();
        let ready = rows.is_some() && (environment.is_some() || !self.job.web);
        if let (true, Some(rows)) = (ready, rows) {
            let sessions = environment
                .as_ref()
                .map(|env| env.sessions.clone())
                .unwrap_or_else(SessionPool::empty);
            let sandbox = self.sandbox();

            self.enter(Phase::RunningSetup);
            if let Some(script) = self.job.setup_script.clone() {
                self.run_phase("setup", &script, &sandbox, &sessions).await;
            }

            self.enter(Phase::RunningCases);
            let workers = self
                .deps
                .config
                .execution
                .effective_concurrency(self.job.concurrency, self.job.web);
            let token = Arc::new(CancellationToken::new(
                self.job.id.clone(),
                self.deps.stop_flags.clone(),
            ));
            let scheduler = CaseScheduler::new(
                workers,
                sandbox.clone(),
                sessions.clone(),
                self.deps.publisher.clone(),
                token,
            );
            outcome = scheduler.run_all(rows, &self.job.body_script).await;

            self.enter(Phase::RunningTeardown);
            if let Some(script) = self.job.teardown_script.clone() {
                self.run_phase("teardown", &script, &sandbox, &sessions).await;
            }

            self.enter(Phase::CollectingEvidence);
            if let Err(e) = collect_job_evidence(&self.deps.store, &self.job.id) {
                warn!(job_id = %self.job.id, error = %e, "evidence collection failed");
            }
        }

        self.enter(Phase::Cleanup);
        if let Some(env) = environment {
            env.sessions.close_all().await;
            if let Some(provisioner) = &self.deps.provisioner {
                provisioner.destroy(&env.handle).await;
            }
        }

        let status = final_status(
            outcome.stop_observed,
            !self.failures.is_empty() || outcome.any_failed(),
        );
        self.job.status = status;
        self.publish_final(status, outcome.records.len()).await;

        JobSummary {
            job_id: self.job.id,
            status,
            cases: outcome.records,
            not_started: outcome.not_started,
            failures: self.failures,
        }
    }

    fn load_cases(&mut self) -> Option<Vec<Map<String, Value>>> {
        let loaded = resolve_case_source(&self.deps.config.paths.test_cases_dir, &self.job.case_source)
            .and_then(|path| load_rows(&path));
        match loaded {
            Ok(rows) => {
                info!(job_id = %self.job.id, cases = rows.len(), "case data loaded");
                Some(rows)
            }
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    async fn provision(&mut self) -> Option<Environment> {
        self.enter(Phase::Provisioning);
        let Some(provisioner) = self.deps.provisioner.clone() else {
            self.fail("web job submitted but no container runtime is available".to_string());
            return None;
        };

        let sessions = self
            .deps
            .config
            .execution
            .effective_concurrency(self.job.concurrency, true);
        match provisioner.provision(sessions).await {
            Ok(env) => {
                if let Err(e) = self.deps.store.record_ports(&self.job.id, env.handle.ports) {
                    warn!(job_id = %self.job.id, error = %e, "failed to record ports");
                }
                Some(env)
            }
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    fn sandbox(&mut self) -> ScriptSandbox {
        let config = &self.deps.config;
        let credentials = std::mem::replace(&mut self.job.credentials, CredentialSet::empty());
        ScriptSandbox::new(SandboxContext {
            job_id: self.job.id.clone(),
            store: self.deps.store.clone(),
            services: self.deps.services.clone(),
            credentials: Arc::new(credentials),
            evidence_root: config.paths.evidence_dir.join(&self.job.id),
            highlight: Duration::from_millis(config.execution.highlight_millis),
            element_poll: Duration::from_millis(config.execution.element_poll_millis),
        })
    }

    /// Run a setup or teardown script once. Failures mark the job failed and
    /// land in the job's failed-cases artifact.
    async fn run_phase(&mut self, label: &str, script: &str, sandbox: &ScriptSandbox, sessions: &SessionPool) {
        let lease = sessions.acquire().await;
        let mut table = sandbox.bind(CaseContext {
            case_id: new_case_id(),
            row: Map::new(),
            session: lease.as_ref().and_then(|l| l.session()),
            evidence_dir: sandbox.evidence_root().to_path_buf(),
        });

        let result = execute_in_sandbox(script, &mut table).await;
        drop(lease);

        if let Err(fault) = result {
            let message = format!("{label} script failed: {fault}");
            let file_name = format!("{}_failed_cases.txt", self.job.id);
            let uri: PathBuf = sandbox.evidence_root().join(&file_name);
            if let Err(e) = self
                .deps
                .store
                .append_evidence(&self.job.id, None, &file_name, &uri, &message)
            {
                warn!(job_id = %self.job.id, error = %e, "failed to record phase failure evidence");
            }
            self.fail(message);
        }
    }

    async fn publish_final(&self, status: JobStatus, case_count: usize) {
        let store = &self.deps.store;
        let job_id = self.job.id.as_str();
        let recorded = retry(FINAL_ATTEMPTS, FINAL_BACKOFF, move |_| async move {
            store.record_status(job_id, status, Some(case_count))
        })
        .await;
        if let Err(e) = recorded {
            error!(job_id = %job_id, error = %e, "final status could not be recorded");
        }

        let event = JobEvent::JobCompleted {
            job_id: job_id.to_string(),
            status,
            case_count,
        };
        let publisher = &self.deps.publisher;
        let event = &event;
        let published = retry(FINAL_ATTEMPTS, FINAL_BACKOFF, move |_| async move {
            publisher.publish(event).await
        })
        .await;
        match published {
            Ok(()) => info!(job_id = %job_id, %status, cases = case_count, "job completed"),
            Err(e) => error!(job_id = %job_id, error = %e, "job-completed event lost"),
        }
    }
}
