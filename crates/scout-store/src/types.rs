//! Store record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::StoreError;

/// Row id of a tracked profile.
pub type ProfileId = i64;

/// Row id of a scrape job.
pub type JobId = i64;

/// Retry cap applied to new jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lowest accepted profile priority.
const MIN_PRIORITY: i32 = 1;

/// Highest accepted profile priority.
const MAX_PRIORITY: i32 = 10;

/// How often a profile should be collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingFrequency {
    Hourly,
    #[default]
    Daily,
    Weekly,
}

impl TrackingFrequency {
    /// Label stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    /// Parse a stored label. Returns `None` for anything unrecognized.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }
}

impl fmt::Display for TrackingFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingFrequency {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| StoreError::Invalid {
            field: "tracking_frequency",
            reason: format!("'{s}' is not one of hourly, daily, weekly"),
        })
    }
}

/// What a scrape job collects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Profile,
    Posts,
    #[default]
    Full,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Posts => "posts",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "profile" => Ok(Self::Profile),
            "posts" => Ok(Self::Posts),
            "full" => Ok(Self::Full),
            _ => Err(StoreError::Invalid {
                field: "job_type",
                reason: format!("'{s}' is not one of profile, posts, full"),
            }),
        }
    }
}

/// Lifecycle state of a scrape job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet handed to the workflow.
    #[default]
    Pending,
    /// The workflow process is running.
    Running,
    /// The workflow exited successfully.
    Completed,
    /// The workflow failed, timed out, or could not be launched.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Invalid {
                field: "status",
                reason: format!("'{s}' is not a job status"),
            }),
        }
    }
}

/// A profile whose data is collected periodically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedProfile {
    pub id: ProfileId,
    /// Public URL of the profile; unique across the store.
    pub profile_url: String,
    pub display_name: String,
    pub active: bool,
    /// 1-10, higher is scheduled first.
    pub priority: i32,
    pub tracking_frequency: TrackingFrequency,
    pub created_at: DateTime<Utc>,
    /// When the workflow last collected this profile.
    ///
    /// Stored in `last_scraped_at`, which the workflow writes itself.
    pub last_run_at: Option<DateTime<Utc>>,
    /// When this profile becomes due again. `None` means due now.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl TrackedProfile {
    /// Check if this profile is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run_at.is_none_or(|next| next <= now)
    }
}

/// Registration data for a new profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProfile {
    pub profile_url: String,
    pub display_name: String,
    pub priority: i32,
    pub tracking_frequency: TrackingFrequency,
}

impl NewProfile {
    /// Create a registration with default priority (5) and daily tracking.
    pub fn new(profile_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            profile_url: profile_url.into(),
            display_name: display_name.into(),
            priority: 5,
            tracking_frequency: TrackingFrequency::Daily,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_frequency(mut self, frequency: TrackingFrequency) -> Self {
        self.tracking_frequency = frequency;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if self.profile_url.trim().is_empty() {
            return Err(StoreError::Invalid {
                field: "profile_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.display_name.trim().is_empty() {
            return Err(StoreError::Invalid {
                field: "display_name",
                reason: "must not be empty".to_string(),
            });
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(StoreError::Invalid {
                field: "priority",
                reason: format!(
                    "{} is outside {MIN_PRIORITY}..={MAX_PRIORITY}",
                    self.priority
                ),
            });
        }
        Ok(())
    }
}

/// Result counters reported by the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub items_scraped: u32,
    pub new_items_found: u32,
    pub changes_detected: u32,
}

/// Why an operator retry was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryRejection {
    #[error("job is {0}, only failed jobs can be retried")]
    NotFailed(JobStatus),

    #[error("retry limit reached ({retry_count}/{max_retries})")]
    Exhausted { retry_count: u32, max_retries: u32 },

    #[error("job has no profile to replay")]
    NoProfile,
}

/// The audit record of one workflow dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: JobId,
    /// `None` for batch and analysis jobs.
    pub profile_id: Option<ProfileId>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_scraped: u32,
    pub new_items_found: u32,
    pub changes_detected: u32,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Scheduler instance that last dispatched the job.
    pub owner: Option<String>,
}

impl ScrapeJob {
    /// Move to `running`.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
    }

    /// Move to `completed` and record the workflow's counters.
    pub fn complete(&mut self, now: DateTime<Utc>, counts: JobCounts) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.items_scraped = counts.items_scraped;
        self.new_items_found = counts.new_items_found;
        self.changes_detected = counts.changes_detected;
        self.error_message = None;
    }

    /// Move to `failed` with an error message.
    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(now);
        self.error_message = Some(error.into());
    }

    /// Reset a failed job to `pending` for another attempt.
    ///
    /// Increments `retry_count`; refuses once `max_retries` is reached.
    pub fn prepare_retry(&mut self) -> Result<(), RetryRejection> {
        if self.status != JobStatus::Failed {
            return Err(RetryRejection::NotFailed(self.status));
        }
        if self.profile_id.is_none() {
            return Err(RetryRejection::NoProfile);
        }
        if self.retry_count >= self.max_retries {
            return Err(RetryRejection::Exhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }

        self.retry_count += 1;
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        Ok(())
    }

    /// Wall-clock seconds between start and completion.
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// A job to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub profile_id: Option<ProfileId>,
    pub job_type: JobType,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub owner: Option<String>,
}

impl NewJob {
    pub fn new(job_type: JobType, profile_id: Option<ProfileId>, created_at: DateTime<Utc>) -> Self {
        Self {
            profile_id,
            job_type,
            created_at,
            scheduled_at: None,
            max_retries: DEFAULT_MAX_RETRIES,
            owner: None,
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub profile_id: Option<ProfileId>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            profile_id: None,
            limit: 50,
        }
    }
}
