//! Persistence for Scout.
//!
//! This crate owns the two records the scheduler reads and writes:
//! - `TrackedProfile`: an external profile that is collected on a cadence
//! - `ScrapeJob`: the audit record of one workflow dispatch
//!
//! The [`Store`] trait is the only surface the scheduler depends on;
//! [`SqliteStore`] is the production implementation.
//!
//! ## Shared database
//!
//! The collection workflow opens the same SQLite file. After each run it
//! sets `tracked_profiles.last_scraped_at` to `datetime('now')`, which is
//! UTC text in the form `YYYY-MM-DD HH:MM:SS`. Scout reads that column as
//! [`TrackedProfile::last_run_at`] and accepts both that form and the
//! RFC 3339 stamps it writes itself. `next_run_at` is owned by Scout.
//!
//! Several Scout processes (the daemon and one-shot CLI commands) may share
//! the file. A profile is dispatched only by the process holding its row in
//! `profile_claims`; see [`Store::claim_profiles`].

mod error;
mod sqlite;
mod store;
mod types;

pub use error::StoreError;
pub use sqlite::SqliteStore;
pub use store::{NextRun, Store};
pub use types::{
    DEFAULT_MAX_RETRIES, JobCounts, JobFilter, JobId, JobStatus, JobType, NewJob, NewProfile,
    ProfileId, RetryRejection, ScrapeJob, TrackedProfile, TrackingFrequency,
};
