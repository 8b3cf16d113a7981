use crate::jobs::LeaseManager;

/// Receives advisory progress. Implementations must not fail the job.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: u32, detail: &str);
}

/// Writes progress to the job row, fenced by the lease token so a stale
/// worker cannot overwrite a newer owner's progress.
pub struct StoreProgress {
    leases: LeaseManager,
    job_id: String,
    token: String,
}

impl StoreProgress {
    pub fn new(leases: LeaseManager, job_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            leases,
            job_id: job_id.into(),
            token: token.into(),
        }
    }
}

impl ProgressReporter for StoreProgress {
    fn report(&self, percent: u32, detail: &str) {
        match self
            .leases
            .update_progress(&self.job_id, &self.token, percent, detail)
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(job_id = %self.job_id, "Progress write fenced off"),
            Err(e) => tracing::warn!(job_id = %self.job_id, error = %e, "Progress write failed"),
        }
    }
}
