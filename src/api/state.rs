use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::job::coordinator::{Collaborators, JobCoordinator};
use crate::job::{ExecutionJob, JobStatus};

#[derive(Clone)]
pub struct AppState {
    pub deps: Collaborators,
    /// Master secret for password credentials.
    pub secret_key: Option<String>,
    /// Ids of jobs currently owned by a coordinator in this process.
    pub running: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    pub fn new(deps: Collaborators, secret_key: Option<String>) -> Self {
        Self {
            deps,
            secret_key,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Record `job` as pending and spawn its coordinator. `Ok(false)` if the
    /// id is already running; its stored status is left alone.
    pub fn launch(&self, job: ExecutionJob) -> anyhow::Result<bool> {
        let id = job.id.clone();
        let inserted = self
            .running
            .lock()
            .map(|mut running| running.insert(id.clone()))
            .unwrap_or(false);
        if !inserted {
            return Ok(false);
        }

        if let Err(e) = self.deps.store.record_status(&id, JobStatus::Pending, None) {
            if let Ok(mut running) = self.running.lock() {
                running.remove(&id);
            }
            return Err(e);
        }

        let running = self.running.clone();
        let coordinator = JobCoordinator::new(job, self.deps.clone());
        tokio::spawn(async move {
            coordinator.run().await;
            if let Ok(mut running) = running.lock() {
                running.remove(&id);
            }
        });
        Ok(true)
    }
}
