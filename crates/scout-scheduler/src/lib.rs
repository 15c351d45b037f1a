//! Scheduler for Scout.
//!
//! This crate decides which tracked profiles are due, dispatches them in
//! bounded batches to the external collection workflow, and records each
//! dispatch as a job:
//! - [`frequency`] maps a tracking tier to the next due time
//! - [`DueSetSelector`] picks due profiles by priority and staleness
//! - [`JobTracker`] moves jobs through pending, running, and a terminal state
//! - [`Scheduler`] runs the periodic loop and the manual triggers

mod claims;
mod clock;
mod error;
pub mod frequency;
mod jobs;
mod scheduler;
mod selector;

pub use claims::{ClaimGuard, Claims};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SchedulerError;
pub use jobs::JobTracker;
pub use scheduler::{
    BatchDispatch, DEFAULT_BATCH_SIZE, DEFAULT_CHECK_INTERVAL, DEFAULT_CLAIM_TTL, DispatchOutcome,
    INTERRUPTED_MESSAGE, Scheduler, SchedulerConfig, SingleDispatch,
};
pub use selector::DueSetSelector;
