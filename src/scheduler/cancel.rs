//! Cooperative cancellation backed by the store's stop flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::storage::Store;

/// Durable stop flags keyed by job id.
pub trait StopFlags: Send + Sync {
    fn is_stopped(&self, job_id: &str) -> anyhow::Result<bool>;
    fn request_stop(&self, job_id: &str) -> anyhow::Result<()>;
}

impl StopFlags for Store {
    fn is_stopped(&self, job_id: &str) -> anyhow::Result<bool> {
        Store::is_stopped(self, job_id)
    }

    fn request_stop(&self, job_id: &str) -> anyhow::Result<()> {
        Store::request_stop(self, job_id)
    }
}

/// Polling client for one job's stop flag.
///
/// Every check reads the store; only an observed stop is remembered, since
/// a flag is never cleared once set.
pub struct CancellationToken {
    job_id: String,
    flags: Arc<dyn StopFlags>,
    observed: AtomicBool,
}

impl CancellationToken {
    pub fn new(job_id: impl Into<String>, flags: Arc<dyn StopFlags>) -> Self {
        Self {
            job_id: job_id.into(),
            flags,
            observed: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Point-in-time check. A failed read counts as not stopped.
    pub fn is_stopped(&self) -> bool {
        if self.observed.load(Ordering::SeqCst) {
            return true;
        }
        match self.flags.is_stopped(&self.job_id) {
            Ok(true) => {
                if !self.observed.swap(true, Ordering::SeqCst) {
                    info!(job_id = %self.job_id, "stop request observed");
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "stop flag read failed, continuing");
                false
            }
        }
    }

    /// Whether any check so far has seen the stop flag.
    pub fn observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }
}
