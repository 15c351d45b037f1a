//! Job lifecycle tracking.
//!
//! Every dispatch is recorded as a job that moves
//! `pending -> running -> completed | failed`. Terminal states are final
//! except through an operator retry, which resets a failed job to pending.

use std::sync::Arc;

use tracing::{error, warn};

use scout_store::{
    JobId, JobType, NewJob, ProfileId, RetryRejection, ScrapeJob, Store, StoreError,
};
use scout_workflow::{ExecutionResult, preview};

use crate::{Clock, SchedulerError};

/// Records dispatches as jobs owned by one scheduler instance.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    owner: Arc<str>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, owner: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            clock,
            owner: owner.into(),
        }
    }

    /// Create a `pending` job. Batch and analysis jobs have no profile.
    pub fn open(
        &self,
        job_type: JobType,
        profile_id: Option<ProfileId>,
    ) -> Result<ScrapeJob, StoreError> {
        let now = self.clock.now();
        self.store
            .insert_job(
                &NewJob::new(job_type, profile_id, now)
                    .scheduled_at(now)
                    .owned_by(self.owner.as_ref()),
            )
    }

    /// Move a job to `running` and persist it.
    pub fn mark_running(&self, job: &mut ScrapeJob) -> Result<(), StoreError> {
        job.start(self.clock.now());
        self.store.update_job(job)
    }

    /// Apply a workflow result to a job in memory.
    pub fn settle(&self, job: &mut ScrapeJob, result: &ExecutionResult) {
        let now = self.clock.now();
        if result.success {
            job.complete(now, result.counts);
        } else {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "workflow failed".to_string());
            warn!(
                job_id = job.id,
                timed_out = result.timed_out,
                error = %message,
                output = preview(&result.output),
                "workflow run failed"
            );
            job.fail(now, message);
        }
    }

    /// Apply a workflow result and persist the terminal state.
    pub fn mark_terminal(
        &self,
        job: &mut ScrapeJob,
        result: &ExecutionResult,
    ) -> Result<(), StoreError> {
        self.settle(job, result);
        if let Err(e) = self.store.update_job(job) {
            self.record_persistence_failure(job, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Best-effort: leave a job `failed` with the persistence error instead
    /// of stuck in `running`.
    pub fn record_persistence_failure(&self, job: &mut ScrapeJob, cause: &StoreError) {
        job.fail(
            self.clock.now(),
            format!("failed to record job outcome: {cause}"),
        );
        if let Err(e) = self.store.update_job(job) {
            error!(job_id = job.id, error = %e, "could not record job failure");
        }
    }

    /// Reset a failed single-profile job to `pending` for another attempt.
    /// The job is rescheduled now and taken over by this tracker's owner.
    ///
    /// Returns the job and the profile it targets.
    pub fn retry(&self, job_id: JobId) -> Result<(ScrapeJob, ProfileId), SchedulerError> {
        let mut job = self
            .store
            .get_job(job_id)
            .map_err(SchedulerError::Persistence)?
            .ok_or(SchedulerError::JobNotFound(job_id))?;

        job.prepare_retry()
            .map_err(|reason| SchedulerError::RetryRejected { job_id, reason })?;

        let profile_id = job.profile_id.ok_or(SchedulerError::RetryRejected {
            job_id,
            reason: RetryRejection::NoProfile,
        })?;
        job.scheduled_at = Some(self.clock.now());
        job.owner = Some(self.owner.to_string());

        self.store
            .update_job(&job)
            .map_err(SchedulerError::Persistence)?;
        Ok((job, profile_id))
    }
}
