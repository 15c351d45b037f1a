//! The store contract the scheduler depends on.

use chrono::{DateTime, Utc};

use crate::{
    JobFilter, JobId, NewJob, NewProfile, ProfileId, ScrapeJob, StoreError, TrackedProfile,
};

/// A next-due stamp for one dispatched profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRun {
    pub profile_id: ProfileId,
    pub next_run_at: DateTime<Utc>,
}

/// Persistent state shared by the scheduler loop and manual triggers.
///
/// Implementations must be safe to call from several tasks at once.
pub trait Store: Send + Sync {
    /// Active profiles with `next_run_at` unset or `<= now`, ordered by
    /// priority descending, then never-run first, then oldest `last_run_at`
    /// by instant rather than by text.
    /// At most `limit` rows.
    fn due_profiles(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrackedProfile>, StoreError>;

    /// Active profiles among `ids`, in due-set order. Unknown ids are skipped.
    fn active_profiles_by_ids(&self, ids: &[ProfileId]) -> Result<Vec<TrackedProfile>, StoreError>;

    fn get_profile(&self, id: ProfileId) -> Result<Option<TrackedProfile>, StoreError>;

    fn insert_profile(
        &self,
        profile: &NewProfile,
        now: DateTime<Utc>,
    ) -> Result<TrackedProfile, StoreError>;

    fn list_profiles(&self, active_only: bool) -> Result<Vec<TrackedProfile>, StoreError>;

    fn set_profile_active(&self, id: ProfileId, active: bool) -> Result<(), StoreError>;

    fn insert_job(&self, job: &NewJob) -> Result<ScrapeJob, StoreError>;

    /// Overwrite every mutable column of an existing job.
    fn update_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;

    fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>, StoreError>;

    /// Jobs matching `filter`, newest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScrapeJob>, StoreError>;

    /// Write a job's terminal state and the next-due stamps of the profiles
    /// it covered in a single transaction. Nothing is written on error.
    fn commit_dispatch(&self, job: &ScrapeJob, next_runs: &[NextRun]) -> Result<(), StoreError>;

    /// Claim `ids` for `owner` and return the ids that were won.
    ///
    /// A profile already claimed by any owner is skipped unless its claim
    /// is older than `stale_before`, in which case it is taken over.
    fn claim_profiles(
        &self,
        ids: &[ProfileId],
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ProfileId>, StoreError>;

    /// Drop the claims `owner` holds on `ids`. Claims held by others are kept.
    fn release_profiles(&self, ids: &[ProfileId], owner: &str) -> Result<(), StoreError>;

    /// Every currently claimed profile id, ascending.
    fn claimed_profiles(&self) -> Result<Vec<ProfileId>, StoreError>;

    /// Mark `pending` or `running` jobs left behind by `owner` as failed
    /// with `message`, together with unowned jobs and jobs of any owner
    /// that started before `stale_before`. Claims held by `owner` or older
    /// than `stale_before` are dropped. Returns the number of jobs changed.
    fn fail_unfinished_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<usize, StoreError>;
}
