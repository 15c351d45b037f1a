//! Error types for the scheduler.

use thiserror::Error;

use scout_store::{JobId, ProfileId, RetryRejection, StoreError};

/// Errors that can occur in scheduler operations.
///
/// Workflow failures are not errors: they are recorded on the job.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The store could not produce the due set.
    #[error("due-set selection failed: {0}")]
    Selection(#[source] StoreError),

    /// Writing job or profile state failed; the cycle's writes were rolled back.
    #[error("persistence failed: {0}")]
    Persistence(#[source] StoreError),

    /// Profile not found.
    #[error("profile not found: {0}")]
    ProfileNotFound(ProfileId),

    /// Another dispatch for this profile is still running.
    #[error("profile {0} already has a dispatch in flight")]
    ProfileBusy(ProfileId),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// An operator retry was refused.
    #[error("retry of job {job_id} rejected: {reason}")]
    RetryRejected {
        job_id: JobId,
        #[source]
        reason: RetryRejection,
    },

    /// `start` was called while the loop is already running.
    #[error("scheduler is already running")]
    AlreadyRunning,
}
