//! Shared fixtures for scheduler tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Notify;

use scout_scheduler::ManualClock;
use scout_store::{
    JobFilter, JobId, NewJob, NewProfile, NextRun, ProfileId, ScrapeJob, SqliteStore, Store,
    StoreError, TrackedProfile, TrackingFrequency,
};
use scout_workflow::{ExecutionResult, WorkflowExecutor, WorkflowOperation};

/// The instant every test cycle runs at.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap()
}

/// Executor that records calls instead of spawning anything.
pub struct FakeExecutor {
    calls: Mutex<Vec<WorkflowOperation>>,
    result: Mutex<ExecutionResult>,
    /// Notified each time a run begins.
    pub started: Notify,
    hold: Option<Notify>,
    advance: Option<(Arc<ManualClock>, Duration)>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::returning(ExecutionResult::succeeded("", Default::default()))
    }

    pub fn returning(result: ExecutionResult) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            result: Mutex::new(result),
            started: Notify::new(),
            hold: None,
            advance: None,
        }
    }

    /// Runs block until [`release`](Self::release) is called.
    pub fn held(mut self) -> Self {
        self.hold = Some(Notify::new());
        self
    }

    /// Move `clock` forward by `by` during every run.
    pub fn advancing(mut self, clock: Arc<ManualClock>, by: Duration) -> Self {
        self.advance = Some((clock, by));
        self
    }

    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.notify_one();
        }
    }

    pub fn set_result(&self, result: ExecutionResult) {
        *self.result.lock().unwrap() = result;
    }

    pub fn calls(&self) -> Vec<WorkflowOperation> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, op: WorkflowOperation) -> ExecutionResult {
        self.calls.lock().unwrap().push(op);
        self.started.notify_one();
        if let Some((clock, by)) = &self.advance {
            clock.advance(*by);
        }
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        self.result.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowExecutor for FakeExecutor {
    async fn run_batch(&self, profile_ids: &[ProfileId]) -> ExecutionResult {
        self.record(WorkflowOperation::Batch(profile_ids.to_vec())).await
    }

    async fn run_single(&self, profile_id: ProfileId) -> ExecutionResult {
        self.record(WorkflowOperation::Scrape(profile_id)).await
    }

    async fn run_analysis(&self, limit: u32) -> ExecutionResult {
        self.record(WorkflowOperation::Analyze(limit)).await
    }
}

/// SQLite store that counts writes and can be told to fail.
pub struct CountingStore {
    inner: SqliteStore,
    writes: AtomicUsize,
    selections: AtomicUsize,
    failing_selections: AtomicUsize,
    fail_commit: AtomicBool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            writes: AtomicUsize::new(0),
            selections: AtomicUsize::new(0),
            failing_selections: AtomicUsize::new(0),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &SqliteStore {
        &self.inner
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }

    /// Fail the next `n` due-set queries.
    pub fn fail_selections(&self, n: usize) {
        self.failing_selections.store(n, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Register a profile created well before [`t0`], due immediately.
    pub fn add(&self, name: &str, priority: i32, frequency: TrackingFrequency) -> TrackedProfile {
        let profile = NewProfile::new(format!("https://www.linkedin.com/in/{name}"), name)
            .with_priority(priority)
            .with_frequency(frequency);
        self.inner
            .insert_profile(&profile, t0() - Duration::days(30))
            .unwrap()
    }

    pub fn profile(&self, id: ProfileId) -> TrackedProfile {
        self.inner.get_profile(id).unwrap().unwrap()
    }

    pub fn job(&self, id: JobId) -> ScrapeJob {
        self.inner.get_job(id).unwrap().unwrap()
    }

    /// Whether any profile is currently claimed.
    pub fn has_claims(&self) -> bool {
        !self.inner.claimed_profiles().unwrap().is_empty()
    }

    pub fn all_jobs(&self) -> Vec<ScrapeJob> {
        self.inner
            .list_jobs(&JobFilter {
                limit: 1000,
                ..Default::default()
            })
            .unwrap()
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Store for CountingStore {
    fn due_profiles(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrackedProfile>, StoreError> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_selections.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_selections.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::LockPoisoned);
        }
        self.inner.due_profiles(now, limit)
    }

    fn active_profiles_by_ids(&self, ids: &[ProfileId]) -> Result<Vec<TrackedProfile>, StoreError> {
        self.inner.active_profiles_by_ids(ids)
    }

    fn get_profile(&self, id: ProfileId) -> Result<Option<TrackedProfile>, StoreError> {
        self.inner.get_profile(id)
    }

    fn insert_profile(
        &self,
        profile: &NewProfile,
        now: DateTime<Utc>,
    ) -> Result<TrackedProfile, StoreError> {
        self.wrote();
        self.inner.insert_profile(profile, now)
    }

    fn list_profiles(&self, active_only: bool) -> Result<Vec<TrackedProfile>, StoreError> {
        self.inner.list_profiles(active_only)
    }

    fn set_profile_active(&self, id: ProfileId, active: bool) -> Result<(), StoreError> {
        self.wrote();
        self.inner.set_profile_active(id, active)
    }

    fn insert_job(&self, job: &NewJob) -> Result<ScrapeJob, StoreError> {
        self.wrote();
        self.inner.insert_job(job)
    }

    fn update_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        self.wrote();
        self.inner.update_job(job)
    }

    fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>, StoreError> {
        self.inner.get_job(id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScrapeJob>, StoreError> {
        self.inner.list_jobs(filter)
    }

    fn commit_dispatch(&self, job: &ScrapeJob, next_runs: &[NextRun]) -> Result<(), StoreError> {
        self.wrote();
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::LockPoisoned);
        }
        self.inner.commit_dispatch(job, next_runs)
    }

    fn claim_profiles(
        &self,
        ids: &[ProfileId],
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ProfileId>, StoreError> {
        self.inner.claim_profiles(ids, owner, now, stale_before)
    }

    fn release_profiles(&self, ids: &[ProfileId], owner: &str) -> Result<(), StoreError> {
        self.inner.release_profiles(ids, owner)
    }

    fn claimed_profiles(&self) -> Result<Vec<ProfileId>, StoreError> {
        self.inner.claimed_profiles()
    }

    fn fail_unfinished_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<usize, StoreError> {
        self.wrote();
        self.inner.fail_unfinished_jobs(owner, now, stale_before, message)
    }
}
