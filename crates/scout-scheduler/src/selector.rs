//! Due-set selection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use scout_store::{ProfileId, Store, TrackedProfile};

use crate::SchedulerError;

/// Picks which profiles a cycle dispatches.
///
/// A profile is due when it is active and its `next_run_at` is unset or not
/// in the future. The due set is ordered by priority (highest first), then
/// never-run profiles, then the longest since last run, and capped at the
/// batch size.
#[derive(Clone)]
pub struct DueSetSelector {
    store: Arc<dyn Store>,
    batch_size: usize,
}

impl DueSetSelector {
    pub fn new(store: Arc<dyn Store>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The due set at `now`. Empty when nothing is due or the batch size is 0.
    pub fn select(&self, now: DateTime<Utc>) -> Result<Vec<TrackedProfile>, SchedulerError> {
        if self.batch_size == 0 {
            return Ok(Vec::new());
        }

        let due = self
            .store
            .due_profiles(now, self.batch_size)
            .map_err(SchedulerError::Selection)?;

        debug!(count = due.len(), limit = self.batch_size, "selected due profiles");
        Ok(due)
    }

    /// Active profiles among `ids`, in due-set order, ignoring `next_run_at`.
    pub fn select_ids(&self, ids: &[ProfileId]) -> Result<Vec<TrackedProfile>, SchedulerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.store
            .active_profiles_by_ids(ids)
            .map_err(SchedulerError::Selection)
    }
}
