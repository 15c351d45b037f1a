mod common;

use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;

use common::{CountingStore, FakeExecutor, t0};
use scout_scheduler::{
    DispatchOutcome, INTERRUPTED_MESSAGE, ManualClock, Scheduler, SchedulerConfig, SchedulerError,
};
use scout_store::{
    JobCounts, JobStatus, JobType, NewJob, RetryRejection, Store, TrackingFrequency,
};
use scout_workflow::{ExecutionResult, WorkflowError, WorkflowOperation};

struct Harness {
    store: Arc<CountingStore>,
    executor: Arc<FakeExecutor>,
    clock: Arc<ManualClock>,
    scheduler: Arc<Scheduler>,
}

fn harness_with(executor: FakeExecutor, config: SchedulerConfig) -> Harness {
    let store = Arc::new(CountingStore::new());
    let executor = Arc::new(executor);
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Arc::new(Scheduler::with_clock(
        store.clone(),
        executor.clone(),
        config,
        clock.clone(),
    ));
    Harness {
        store,
        executor,
        clock,
        scheduler,
    }
}

fn harness() -> Harness {
    harness_with(FakeExecutor::new(), SchedulerConfig::default())
}

#[tokio::test]
async fn test_nothing_due_writes_and_spawns_nothing() {
    let h = harness();
    let waiting = h.store.add("waiting", 5, TrackingFrequency::Daily);
    let paused = h.store.add("paused", 5, TrackingFrequency::Daily);
    h.store
        .inner()
        .set_next_run(waiting.id, Some(t0() + Duration::minutes(1)))
        .unwrap();
    h.store.inner().set_profile_active(paused.id, false).unwrap();
    let writes_before = h.store.writes();

    let outcome = h.scheduler.check_and_dispatch().await.unwrap();

    assert!(matches!(outcome, DispatchOutcome::Idle));
    assert_eq!(h.store.writes(), writes_before);
    assert!(h.executor.calls().is_empty());
    assert!(h.store.all_jobs().is_empty());
}

#[tokio::test]
async fn test_next_run_follows_each_profiles_tier() {
    let h = harness();
    let a = h.store.add("a", 5, TrackingFrequency::Daily);
    let b = h.store.add("b", 5, TrackingFrequency::Weekly);
    let c = h.store.add("c", 5, TrackingFrequency::Hourly);

    let outcome = h.scheduler.check_and_dispatch().await.unwrap();
    let batch = outcome.batch().unwrap();

    assert_eq!(batch.job.status, JobStatus::Completed);
    assert_eq!(batch.job.job_type, JobType::Full);
    assert_eq!(batch.job.profile_id, None);
    assert_eq!(h.executor.calls().len(), 1);

    assert_eq!(h.store.profile(a.id).next_run_at, Some(t0() + Duration::days(1)));
    assert_eq!(h.store.profile(b.id).next_run_at, Some(t0() + Duration::days(7)));
    assert_eq!(h.store.profile(c.id).next_run_at, Some(t0() + Duration::hours(1)));
}

#[tokio::test]
async fn test_next_run_uses_cycle_start_time() {
    let store = Arc::new(CountingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let executor =
        Arc::new(FakeExecutor::new().advancing(clock.clone(), Duration::minutes(20)));
    let scheduler = Scheduler::with_clock(
        store.clone(),
        executor.clone(),
        SchedulerConfig::default(),
        clock.clone(),
    );
    let a = store.add("a", 5, TrackingFrequency::Daily);

    let outcome = scheduler.check_and_dispatch().await.unwrap();
    let job = &outcome.batch().unwrap().job;

    assert_eq!(store.profile(a.id).next_run_at, Some(t0() + Duration::days(1)));
    assert_eq!(job.started_at, Some(t0()));
    assert_eq!(job.completed_at, Some(t0() + Duration::minutes(20)));
}

#[tokio::test]
async fn test_never_run_profile_beats_stale_one_at_equal_priority() {
    let h = harness_with(
        FakeExecutor::new(),
        SchedulerConfig::default().with_batch_size(1),
    );
    let x = h.store.add("x", 9, TrackingFrequency::Daily);
    let y = h.store.add("y", 9, TrackingFrequency::Daily);
    h.store
        .inner()
        .set_last_run(x.id, Some(t0() - Duration::days(2)))
        .unwrap();

    h.scheduler.check_and_dispatch().await.unwrap();

    assert_eq!(h.executor.calls(), vec![WorkflowOperation::Batch(vec![y.id])]);
}

#[tokio::test]
async fn test_priority_then_staleness_order() {
    let h = harness();
    let low = h.store.add("low", 2, TrackingFrequency::Daily);
    let recent = h.store.add("recent", 8, TrackingFrequency::Daily);
    let stale = h.store.add("stale", 8, TrackingFrequency::Daily);
    let top = h.store.add("top", 10, TrackingFrequency::Daily);
    h.store
        .inner()
        .set_last_run(recent.id, Some(t0() - Duration::hours(3)))
        .unwrap();
    h.store
        .inner()
        .set_last_run(stale.id, Some(t0() - Duration::days(3)))
        .unwrap();

    let outcome = h.scheduler.check_and_dispatch().await.unwrap();

    assert_eq!(
        outcome.batch().unwrap().profile_ids,
        vec![top.id, stale.id, recent.id, low.id]
    );
}

#[tokio::test]
async fn test_batch_size_caps_each_cycle() {
    let h = harness();
    let ids: Vec<_> = (0..12)
        .map(|i| h.store.add(&format!("p{i}"), 5, TrackingFrequency::Daily).id)
        .collect();

    let first = h.scheduler.check_and_dispatch().await.unwrap();
    assert_eq!(first.batch().unwrap().profile_ids, ids[..10].to_vec());

    let second = h.scheduler.check_and_dispatch().await.unwrap();
    assert_eq!(second.batch().unwrap().profile_ids, ids[10..].to_vec());

    let third = h.scheduler.check_and_dispatch().await.unwrap();
    assert!(matches!(third, DispatchOutcome::Idle));
    assert_eq!(h.executor.calls().len(), 2);
}

#[tokio::test]
async fn test_timeout_fails_job_but_still_advances_every_profile() {
    let h = harness_with(
        FakeExecutor::returning(ExecutionResult::from_error(
            &WorkflowError::Timeout(std::time::Duration::from_secs(600)),
            "",
        )),
        SchedulerConfig::default(),
    );
    let profiles: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| h.store.add(name, 5, TrackingFrequency::Daily))
        .collect();

    let outcome = h.scheduler.check_and_dispatch().await.unwrap();
    let batch = outcome.batch().unwrap();

    assert!(batch.result.timed_out);
    let job = h.store.job(batch.job.id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("timeout"));
    for profile in &profiles {
        assert_eq!(
            h.store.profile(profile.id).next_run_at,
            Some(t0() + Duration::days(1))
        );
    }
}

#[tokio::test]
async fn test_successful_batch_records_counts() {
    let counts = JobCounts {
        items_scraped: 14,
        new_items_found: 4,
        changes_detected: 2,
    };
    let h = harness_with(
        FakeExecutor::returning(ExecutionResult::succeeded("{}", counts)),
        SchedulerConfig::default(),
    );
    h.store.add("a", 5, TrackingFrequency::Daily);

    let outcome = h.scheduler.check_and_dispatch().await.unwrap();
    let job = h.store.job(outcome.batch().unwrap().job.id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.items_scraped, 14);
    assert_eq!(job.new_items_found, 4);
    assert_eq!(job.changes_detected, 2);
}

#[tokio::test]
async fn test_selection_failure_spawns_nothing() {
    let h = harness();
    h.store.add("a", 5, TrackingFrequency::Daily);
    h.store.fail_selections(1);

    let err = h.scheduler.check_and_dispatch().await.unwrap_err();

    assert!(matches!(err, SchedulerError::Selection(_)));
    assert!(h.executor.calls().is_empty());
    assert!(h.store.all_jobs().is_empty());
}

#[tokio::test]
async fn test_commit_failure_leaves_profiles_due_and_job_failed() {
    let h = harness();
    let a = h.store.add("a", 5, TrackingFrequency::Daily);
    h.store.fail_commits(true);

    let err = h.scheduler.check_and_dispatch().await.unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence(_)));

    assert_eq!(h.store.profile(a.id).next_run_at, None);
    let jobs = h.store.all_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(
        jobs[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("failed to record job outcome")
    );
    assert!(!h.store.has_claims());
}

#[tokio::test]
async fn test_explicit_batch_ignores_schedule_but_not_pause() {
    let h = harness();
    let due_later = h.store.add("later", 5, TrackingFrequency::Weekly);
    let paused = h.store.add("paused", 5, TrackingFrequency::Daily);
    h.store
        .inner()
        .set_next_run(due_later.id, Some(t0() + Duration::days(3)))
        .unwrap();
    h.store.inner().set_profile_active(paused.id, false).unwrap();

    let outcome = h
        .scheduler
        .trigger_batch(Some(vec![paused.id, due_later.id, 999]))
        .await
        .unwrap();

    assert_eq!(outcome.batch().unwrap().profile_ids, vec![due_later.id]);
    assert_eq!(
        h.store.profile(due_later.id).next_run_at,
        Some(t0() + Duration::days(7))
    );
    assert_eq!(h.store.profile(paused.id).next_run_at, None);
}

#[tokio::test]
async fn test_explicit_batch_with_no_active_ids_is_idle() {
    let h = harness();
    let outcome = h.scheduler.trigger_batch(Some(vec![41, 42])).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Idle));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_trigger_batch_without_ids_runs_a_cycle() {
    let h = harness();
    let a = h.store.add("a", 5, TrackingFrequency::Daily);

    let outcome = h.scheduler.trigger_batch(None).await.unwrap();

    assert_eq!(outcome.batch().unwrap().profile_ids, vec![a.id]);
}

#[tokio::test]
async fn test_single_trigger_leaves_schedule_alone() {
    let h = harness();
    let a = h.store.add("a", 5, TrackingFrequency::Daily);

    let run = h.scheduler.trigger_single(a.id, JobType::Profile).await.unwrap();

    assert_eq!(h.executor.calls(), vec![WorkflowOperation::Scrape(a.id)]);
    let job = h.store.job(run.job.id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.job_type, JobType::Profile);
    assert_eq!(job.profile_id, Some(a.id));
    assert_eq!(h.store.profile(a.id).next_run_at, None);
}

#[tokio::test]
async fn test_single_trigger_unknown_profile() {
    let h = harness();
    let err = h.scheduler.trigger_single(77, JobType::Full).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ProfileNotFound(77)));
    assert!(h.store.all_jobs().is_empty());
}

#[tokio::test]
async fn test_busy_profile_is_not_dispatched_twice() {
    let h = harness_with(FakeExecutor::new().held(), SchedulerConfig::default());
    let a = h.store.add("a", 5, TrackingFrequency::Daily);
    let b = h.store.add("b", 5, TrackingFrequency::Daily);

    let scheduler = h.scheduler.clone();
    let first = tokio::spawn(async move { scheduler.trigger_single(a.id, JobType::Full).await });
    h.executor.started.notified().await;

    let err = h.scheduler.trigger_single(a.id, JobType::Full).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ProfileBusy(id) if id == a.id));
    assert_eq!(h.store.all_jobs().len(), 1);

    // The loop skips the busy profile and takes the rest.
    let scheduler = h.scheduler.clone();
    let cycle = tokio::spawn(async move { scheduler.check_and_dispatch().await });
    h.executor.started.notified().await;
    h.executor.release();
    h.executor.release();

    let cycle = cycle.await.unwrap().unwrap();
    let batch = cycle.batch().unwrap();
    assert_eq!(batch.profile_ids, vec![b.id]);
    assert_eq!(batch.skipped, vec![a.id]);
    first.await.unwrap().unwrap();

    assert_eq!(h.store.profile(a.id).next_run_at, None);
    assert!(!h.store.has_claims());
}

#[tokio::test]
async fn test_analysis_run_is_recorded() {
    let h = harness_with(
        FakeExecutor::returning(ExecutionResult::succeeded(
            "",
            JobCounts {
                items_scraped: 17,
                ..Default::default()
            },
        )),
        SchedulerConfig::default(),
    );

    let run = h.scheduler.trigger_analysis(50).await.unwrap();

    assert_eq!(h.executor.calls(), vec![WorkflowOperation::Analyze(50)]);
    let job = h.store.job(run.job.id);
    assert_eq!(job.job_type, JobType::Posts);
    assert_eq!(job.profile_id, None);
    assert_eq!(job.items_scraped, 17);
}

#[tokio::test]
async fn test_retry_replays_same_job_until_limit() {
    let h = harness_with(
        FakeExecutor::returning(ExecutionResult::failed("exit code 1", "")),
        SchedulerConfig::default(),
    );
    let a = h.store.add("a", 5, TrackingFrequency::Daily);

    let run = h.scheduler.trigger_single(a.id, JobType::Profile).await.unwrap();
    let job_id = run.job.id;
    assert_eq!(run.job.status, JobStatus::Failed);

    for attempt in 1..=3 {
        let retried = h.scheduler.retry_job(job_id).await.unwrap();
        assert_eq!(retried.job.id, job_id);
        assert_eq!(retried.job.retry_count, attempt);
        assert_eq!(retried.job.status, JobStatus::Failed);
    }

    let err = h.scheduler.retry_job(job_id).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::RetryRejected {
            reason: RetryRejection::Exhausted { .. },
            ..
        }
    ));
    assert_eq!(h.executor.calls().len(), 4);
    assert_eq!(h.store.all_jobs().len(), 1);
}

#[tokio::test]
async fn test_retry_can_succeed() {
    let h = harness_with(
        FakeExecutor::returning(ExecutionResult::failed("exit code 1", "")),
        SchedulerConfig::default(),
    );
    let a = h.store.add("a", 5, TrackingFrequency::Daily);
    let job_id = h
        .scheduler
        .trigger_single(a.id, JobType::Profile)
        .await
        .unwrap()
        .job
        .id;

    h.executor
        .set_result(ExecutionResult::succeeded("", JobCounts::default()));
    let retried = h.scheduler.retry_job(job_id).await.unwrap();

    let job = h.store.job(job_id);
    assert_eq!(retried.job.status, JobStatus::Completed);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.error_message, None);
}

#[tokio::test]
async fn test_batch_jobs_are_not_retryable() {
    let h = harness_with(
        FakeExecutor::returning(ExecutionResult::failed("exit code 1", "")),
        SchedulerConfig::default(),
    );
    h.store.add("a", 5, TrackingFrequency::Daily);
    let outcome = h.scheduler.check_and_dispatch().await.unwrap();
    let job_id = outcome.batch().unwrap().job.id;

    let err = h.scheduler.retry_job(job_id).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::RetryRejected {
            reason: RetryRejection::NoProfile,
            ..
        }
    ));
    assert!(matches!(
        h.scheduler.retry_job(job_id + 100).await.unwrap_err(),
        SchedulerError::JobNotFound(_)
    ));
}

#[tokio::test]
async fn test_recover_interrupted_jobs() {
    let h = harness();
    let a = h.store.add("a", 5, TrackingFrequency::Daily);
    let pending = h
        .store
        .inner()
        .insert_job(&NewJob::new(JobType::Full, None, t0()))
        .unwrap();
    let mut running = h
        .store
        .inner()
        .insert_job(&NewJob::new(JobType::Profile, Some(a.id), t0()))
        .unwrap();
    running.start(t0());
    h.store.inner().update_job(&running).unwrap();
    h.clock.advance(Duration::hours(1));

    assert_eq!(h.scheduler.recover_interrupted().unwrap(), 2);

    for id in [pending.id, running.id] {
        let job = h.store.job(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    }
    assert_eq!(h.scheduler.recover_interrupted().unwrap(), 0);
}
