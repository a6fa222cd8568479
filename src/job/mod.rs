//! Jobs, cases and their lifecycle state.

pub mod cases;
pub mod coordinator;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{CredentialSet, CredentialSpec};

#[derive(Debug, Error)]
pub enum JobRequestError {
    #[error("execution id must not be empty")]
    MissingId,

    #[error("body script must not be empty")]
    MissingScript,

    #[error("case data source must not be empty")]
    MissingCaseSource,

    #[error("concurrency must be a positive integer, got {0}")]
    InvalidConcurrency(i64),
}

/// Overall state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Stopped,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseStatus::Pending => write!(f, "pending"),
            CaseStatus::Succeeded => write!(f, "succeeded"),
            CaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where a case failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSource {
    /// A declared `assert_that` did not hold.
    Assertion,
    /// Anything else raised while the script ran.
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFailure {
    pub source: FailureSource,
    pub message: String,
}

/// Result of one data row.
#[derive(Debug, Clone, Serialize)]
pub struct CaseRecord {
    pub case_id: String,
    pub job_id: String,
    /// Zero-based position of the row in the case data.
    pub row_index: usize,
    pub status: CaseStatus,
    pub evidence_dir: PathBuf,
    pub error: Option<CaseFailure>,
}

impl CaseRecord {
    pub fn new(case_id: String, job_id: String, row_index: usize, evidence_dir: PathBuf) -> Self {
        Self {
            case_id,
            job_id,
            row_index,
            status: CaseStatus::Pending,
            evidence_dir,
            error: None,
        }
    }

    pub fn succeed(&mut self) {
        self.status = CaseStatus::Succeeded;
        self.error = None;
    }

    pub fn fail(&mut self, source: FailureSource, message: impl Into<String>) {
        self.status = CaseStatus::Failed;
        self.error = Some(CaseFailure {
            source,
            message: message.into(),
        });
    }
}

/// Generate an identifier for a case or phase execution.
pub fn new_case_id() -> String {
    format!("ce-{}", uuid::Uuid::new_v4().simple())
}

/// Inbound job description. Field aliases accept the legacy intake payload.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    #[serde(alias = "test_execution_id")]
    pub execution_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "script")]
    pub body_script: String,
    #[serde(default, alias = "before_script")]
    pub setup_script: Option<String>,
    #[serde(default, alias = "after_script")]
    pub teardown_script: Option<String>,
    #[serde(alias = "test_cases_file")]
    pub case_source: String,
    #[serde(default = "default_concurrency", alias = "threads")]
    pub concurrency: i64,
    #[serde(default)]
    pub web: bool,
    #[serde(default)]
    pub credentials: Vec<CredentialSpec>,
}

fn default_concurrency() -> i64 {
    1
}

/// A validated job, owned by exactly one coordinator.
#[derive(Debug)]
pub struct ExecutionJob {
    pub id: String,
    pub name: Option<String>,
    pub setup_script: Option<String>,
    pub body_script: String,
    pub teardown_script: Option<String>,
    pub case_source: String,
    pub concurrency: usize,
    pub web: bool,
    pub credentials: CredentialSet,
    pub status: JobStatus,
}

impl ExecutionJob {
    /// Validate an inbound request. `secret_key` unlocks password credentials.
    pub fn from_request(
        req: JobRequest,
        secret_key: Option<String>,
    ) -> Result<Self, JobRequestError> {
        if req.execution_id.trim().is_empty() {
            return Err(JobRequestError::MissingId);
        }
        if req.body_script.trim().is_empty() {
            return Err(JobRequestError::MissingScript);
        }
        if req.case_source.trim().is_empty() {
            return Err(JobRequestError::MissingCaseSource);
        }
        if req.concurrency < 1 {
            return Err(JobRequestError::InvalidConcurrency(req.concurrency));
        }

        Ok(Self {
            id: req.execution_id,
            name: req.name,
            setup_script: non_blank(req.setup_script),
            body_script: req.body_script,
            teardown_script: non_blank(req.teardown_script),
            case_source: req.case_source,
            concurrency: req.concurrency as usize,
            web: req.web,
            credentials: CredentialSet::new(secret_key, req.credentials),
            status: JobStatus::Pending,
        })
    }
}

fn non_blank(script: Option<String>) -> Option<String> {
    script.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_payload() -> serde_json::Value {
        serde_json::json!({
            "test_execution_id": "ex-42",
            "name": "checkout flow",
            "script": "assert_that(true, \"ok\")",
            "before_script": "",
            "after_script": "log(\"done\")",
            "test_cases_file": "/uploads/cases.csv",
            "threads": 3,
            "web": false
        })
    }

    #[test]
    fn test_legacy_payload_is_accepted() {
        let req: JobRequest = serde_json::from_value(legacy_payload()).unwrap();
        let job = ExecutionJob::from_request(req, None).unwrap();
        assert_eq!(job.id, "ex-42");
        assert_eq!(job.concurrency, 3);
        assert!(job.setup_script.is_none(), "blank setup is dropped");
        assert_eq!(job.teardown_script.as_deref(), Some("log(\"done\")"));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_rejects_non_positive_concurrency() {
        let mut payload = legacy_payload();
        payload["threads"] = serde_json::json!(0);
        let req: JobRequest = serde_json::from_value(payload).unwrap();
        assert!(matches!(
            ExecutionJob::from_request(req, None),
            Err(JobRequestError::InvalidConcurrency(0))
        ));
    }

    #[test]
    fn test_rejects_empty_script() {
        let mut payload = legacy_payload();
        payload["script"] = serde_json::json!("   ");
        let req: JobRequest = serde_json::from_value(payload).unwrap();
        assert!(matches!(
            ExecutionJob::from_request(req, None),
            Err(JobRequestError::MissingScript)
        ));
    }

    #[test]
    fn test_case_record_failure_is_tagged() {
        let mut rec = CaseRecord::new("ce-1".into(), "ex-1".into(), 0, PathBuf::from("/tmp"));
        assert_eq!(rec.status, CaseStatus::Pending);
        rec.fail(FailureSource::Assertion, "title mismatch");
        assert_eq!(rec.status, CaseStatus::Failed);
        assert_eq!(rec.error.as_ref().unwrap().source, FailureSource::Assertion);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(JobStatus::Stopped.to_string(), "stopped");
    }
}
