//! The scheduler loop and manual triggers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use scout_store::{JobId, JobType, NextRun, ProfileId, ScrapeJob, Store, TrackedProfile};
use scout_workflow::{ExecutionResult, WorkflowExecutor, preview};

use crate::{Claims, Clock, DueSetSelector, JobTracker, SchedulerError, SystemClock, frequency};

/// Default time between cycles.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Default maximum number of profiles per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default age after which another instance's claims and jobs count as
/// abandoned.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30 * 60);

/// Minimum time between cycles.
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Error recorded on jobs left unfinished by a previous process.
pub const INTERRUPTED_MESSAGE: &str = "interrupted before completion";

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between cycles.
    pub check_interval: Duration,
    /// Maximum number of profiles dispatched per cycle.
    pub batch_size: usize,
    /// Job type recorded for batch dispatches.
    pub batch_job_type: JobType,
    /// Names this scheduler in profile claims and job records. Processes
    /// sharing a database must use distinct names.
    pub instance: String,
    /// How long claims and running jobs of other instances are honored.
    /// Must outlast the longest workflow run.
    pub claim_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_job_type: JobType::Full,
            instance: unique_instance(),
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }
}

/// A name no other live scheduler uses: the process id plus a counter.
fn unique_instance() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "pid{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

impl SchedulerConfig {
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_job_type(mut self, job_type: JobType) -> Self {
        self.batch_job_type = job_type;
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }
}

/// A batch that was handed to the workflow.
#[derive(Debug, Clone)]
pub struct BatchDispatch {
    /// The job in its terminal state.
    pub job: ScrapeJob,
    /// Profiles covered by the batch, in due-set order.
    pub profile_ids: Vec<ProfileId>,
    /// Due profiles left out because another dispatch holds them.
    pub skipped: Vec<ProfileId>,
    pub result: ExecutionResult,
}

/// What a cycle did.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Nothing was due; nothing was written or spawned.
    Idle,
    Dispatched(BatchDispatch),
}

impl DispatchOutcome {
    pub fn batch(&self) -> Option<&BatchDispatch> {
        match self {
            Self::Idle => None,
            Self::Dispatched(batch) => Some(batch),
        }
    }
}

/// A single-profile or analysis run.
#[derive(Debug, Clone)]
pub struct SingleDispatch {
    pub job: ScrapeJob,
    pub result: ExecutionResult,
}

/// Periodically dispatches due profiles to the collection workflow.
pub struct Scheduler {
    store: Arc<dyn Store>,
    executor: Arc<dyn WorkflowExecutor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    selector: DueSetSelector,
    jobs: JobTracker,
    claims: Claims,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn WorkflowExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_clock(store, executor, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        executor: Arc<dyn WorkflowExecutor>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            selector: DueSetSelector::new(Arc::clone(&store), config.batch_size),
            jobs: JobTracker::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.instance.as_str(),
            ),
            claims: Claims::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.instance.as_str(),
                config.claim_ttl,
            ),
            store,
            executor,
            clock,
            config,
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the loop until [`stop`](Self::stop) is called.
    ///
    /// The first cycle runs immediately and each later one starts a full
    /// interval after the previous one finished. A cycle that fails is logged
    /// and the loop carries on. A stop request lets the current cycle finish
    /// and prevents the next one from starting. A stop requested before the
    /// loop began is honored: no cycle runs.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _running = RunningFlag(&self.running);

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            self.shutdown.send_replace(false);
            info!("scheduler stopped before its first cycle");
            return Ok(());
        }

        let period = self.config.check_interval.max(MIN_CHECK_INTERVAL);
        info!(
            interval_secs = period.as_secs(),
            batch_size = self.config.batch_size,
            "scheduler started"
        );

        loop {
            match self.check_and_dispatch().await {
                Ok(DispatchOutcome::Idle) => debug!("no profiles due"),
                Ok(DispatchOutcome::Dispatched(_)) => {}
                Err(e) => error!(error = %e, "scheduler cycle failed"),
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {}
                _ = sleep(period) => {}
            }

            if *shutdown_rx.borrow_and_update() {
                break;
            }
        }

        // Consumed; a later start runs normally.
        self.shutdown.send_replace(false);
        info!("scheduler stopped");
        Ok(())
    }

    /// Ask the loop to stop after its current cycle, or not to begin if it
    /// has not started yet.
    pub fn stop(&self) {
        if self.is_running() {
            info!("scheduler stop requested");
        }
        self.shutdown.send_replace(true);
    }

    /// Run one cycle: select the due set at a single instant and dispatch it
    /// as one batch.
    #[tracing::instrument(skip(self))]
    pub async fn check_and_dispatch(&self) -> Result<DispatchOutcome, SchedulerError> {
        let now = self.clock.now();
        let due = self.selector.select(now)?;
        if due.is_empty() {
            return Ok(DispatchOutcome::Idle);
        }
        self.dispatch_batch(due, now).await
    }

    /// Dispatch a batch on demand.
    ///
    /// With `None` this runs one regular cycle. With explicit ids the active
    /// profiles among them are dispatched whether or not they are due.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_batch(
        &self,
        profile_ids: Option<Vec<ProfileId>>,
    ) -> Result<DispatchOutcome, SchedulerError> {
        let Some(ids) = profile_ids else {
            return self.check_and_dispatch().await;
        };

        let now = self.clock.now();
        let profiles = self.selector.select_ids(&ids)?;
        if profiles.is_empty() {
            warn!(requested = ids.len(), "no active profiles among requested ids");
            return Ok(DispatchOutcome::Idle);
        }
        self.dispatch_batch(profiles, now).await
    }

    /// Collect one profile immediately. Its next due time is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_single(
        &self,
        profile_id: ProfileId,
        job_type: JobType,
    ) -> Result<SingleDispatch, SchedulerError> {
        let profile = self
            .store
            .get_profile(profile_id)
            .map_err(SchedulerError::Persistence)?
            .ok_or(SchedulerError::ProfileNotFound(profile_id))?;

        let _claim = self
            .claims
            .claim_one(profile.id)
            .map_err(SchedulerError::Persistence)?
            .ok_or(SchedulerError::ProfileBusy(profile.id))?;

        let job = self
            .jobs
            .open(job_type, Some(profile.id))
            .map_err(SchedulerError::Persistence)?;

        info!(job_id = job.id, profile = %profile.display_name, "dispatching single profile");
        self.run_job(job, self.executor.run_single(profile.id)).await
    }

    /// Run content analysis over up to `limit` unanalyzed items.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_analysis(&self, limit: u32) -> Result<SingleDispatch, SchedulerError> {
        let job = self
            .jobs
            .open(JobType::Posts, None)
            .map_err(SchedulerError::Persistence)?;

        info!(job_id = job.id, limit, "dispatching analysis");
        self.run_job(job, self.executor.run_analysis(limit)).await
    }

    /// Replay a failed single-profile job under the same job record.
    #[tracing::instrument(skip(self))]
    pub async fn retry_job(&self, job_id: JobId) -> Result<SingleDispatch, SchedulerError> {
        let job = self
            .store
            .get_job(job_id)
            .map_err(SchedulerError::Persistence)?
            .ok_or(SchedulerError::JobNotFound(job_id))?;

        // Validate before claiming so a rejected retry reports why.
        job.clone()
            .prepare_retry()
            .map_err(|reason| SchedulerError::RetryRejected { job_id, reason })?;

        let _claim = match job.profile_id {
            Some(profile_id) => Some(
                self.claims
                    .claim_one(profile_id)
                    .map_err(SchedulerError::Persistence)?
                    .ok_or(SchedulerError::ProfileBusy(profile_id))?,
            ),
            None => None,
        };

        let (job, profile_id) = self.jobs.retry(job_id)?;
        info!(job_id, profile_id, attempt = job.retry_count, "retrying job");
        self.run_job(job, self.executor.run_single(profile_id)).await
    }

    /// Fail the jobs an earlier run of this instance left pending or
    /// running, plus unowned jobs and jobs abandoned past the claim ttl.
    /// Live work of other instances is left alone.
    pub fn recover_interrupted(&self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let count = self
            .store
            .fail_unfinished_jobs(
                self.claims.owner(),
                now,
                self.claims.stale_before(now),
                INTERRUPTED_MESSAGE,
            )
            .map_err(SchedulerError::Persistence)?;
        if count > 0 {
            warn!(count, "marked interrupted jobs as failed");
        }
        Ok(count)
    }

    async fn dispatch_batch(
        &self,
        profiles: Vec<TrackedProfile>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, SchedulerError> {
        let ids: Vec<ProfileId> = profiles.iter().map(|p| p.id).collect();
        let (claim, skipped) = self
            .claims
            .claim(&ids)
            .map_err(SchedulerError::Persistence)?;
        if !skipped.is_empty() {
            debug!(?skipped, "skipping profiles claimed by another dispatch");
        }
        if claim.ids().is_empty() {
            return Ok(DispatchOutcome::Idle);
        }

        let next_runs: Vec<NextRun> = profiles
            .iter()
            .filter(|p| claim.ids().contains(&p.id))
            .map(|p| NextRun {
                profile_id: p.id,
                next_run_at: frequency::next_run(p.tracking_frequency, now),
            })
            .collect();

        let mut job = self
            .jobs
            .open(self.config.batch_job_type, None)
            .map_err(SchedulerError::Persistence)?;
        if let Err(e) = self.jobs.mark_running(&mut job) {
            self.jobs.record_persistence_failure(&mut job, &e);
            return Err(SchedulerError::Persistence(e));
        }

        info!(job_id = job.id, count = claim.ids().len(), "dispatching batch");
        let result = self.executor.run_batch(claim.ids()).await;

        self.jobs.settle(&mut job, &result);
        if let Err(e) = self.store.commit_dispatch(&job, &next_runs) {
            error!(job_id = job.id, error = %e, "failed to commit batch outcome");
            self.jobs.record_persistence_failure(&mut job, &e);
            return Err(SchedulerError::Persistence(e));
        }

        if result.success {
            info!(
                job_id = job.id,
                items = job.items_scraped,
                new_items = job.new_items_found,
                changes = job.changes_detected,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "batch completed"
            );
            debug!(output = preview(&result.output), "batch output");
        }

        Ok(DispatchOutcome::Dispatched(BatchDispatch {
            job,
            profile_ids: claim.ids().to_vec(),
            skipped,
            result,
        }))
    }

    async fn run_job(
        &self,
        mut job: ScrapeJob,
        run: impl Future<Output = ExecutionResult>,
    ) -> Result<SingleDispatch, SchedulerError> {
        if let Err(e) = self.jobs.mark_running(&mut job) {
            self.jobs.record_persistence_failure(&mut job, &e);
            return Err(SchedulerError::Persistence(e));
        }

        let result = run.await;
        self.jobs
            .mark_terminal(&mut job, &result)
            .map_err(SchedulerError::Persistence)?;

        if result.success {
            info!(
                job_id = job.id,
                items = job.items_scraped,
                new_items = job.new_items_found,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "job completed"
            );
        }

        Ok(SingleDispatch { job, result })
    }
}
