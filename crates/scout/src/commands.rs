//! One-shot commands.
//!
//! Results are printed as JSON on stdout; logs go to stderr.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Result;
use serde_json::json;
use tracing::info;

use scout_scheduler::{
    DEFAULT_CLAIM_TTL, DispatchOutcome, Scheduler, SchedulerConfig, SingleDispatch,
};
use scout_store::{
    JobFilter, JobId, JobStatus, JobType, NewProfile, ProfileId, SqliteStore, Store,
    TrackingFrequency,
};
use scout_workflow::{ProcessExecutor, WorkflowConfig};

pub fn open_store(path: &Path) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(path).map_err(|e| {
        miette::miette!("failed to open database {}: {}", path.display(), e)
    })?;
    Ok(Arc::new(store))
}

/// Slack on top of the longest workflow timeout before a claim is stale.
const CLAIM_GRACE: Duration = Duration::from_secs(5 * 60);

/// Claims must outlive any workflow run, including the kill and drain.
pub fn claim_ttl(workflow: &WorkflowConfig) -> Duration {
    (workflow.longest_timeout() + CLAIM_GRACE).max(DEFAULT_CLAIM_TTL)
}

/// A scheduler for one command, under a name unique to this process.
pub fn scheduler(store: Arc<SqliteStore>, workflow: WorkflowConfig, batch_size: usize) -> Scheduler {
    let config = SchedulerConfig::default()
        .with_batch_size(batch_size)
        .with_claim_ttl(claim_ttl(&workflow));
    Scheduler::new(store, Arc::new(ProcessExecutor::new(workflow)), config)
}

fn write_json(out: &mut impl Write, value: &serde_json::Value) -> Result<()> {
    writeln!(out, "{value}").map_err(|e| miette::miette!("failed to write output: {}", e))
}

fn to_json(value: &impl serde::Serialize) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| miette::miette!("failed to encode output: {}", e))
}

/// Print a finished run and fail the command if the workflow failed.
fn report(run: &SingleDispatch, out: &mut impl Write) -> Result<()> {
    write_json(out, &to_json(&run.job)?)?;
    if run.result.success {
        Ok(())
    } else {
        Err(miette::miette!(
            "job {} failed: {}",
            run.job.id,
            run.job.error_message.as_deref().unwrap_or("unknown error")
        ))
    }
}

pub async fn dispatch(
    scheduler: &Scheduler,
    ids: Option<Vec<ProfileId>>,
    out: &mut impl Write,
) -> Result<()> {
    let outcome = scheduler
        .trigger_batch(ids)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    match outcome {
        DispatchOutcome::Idle => {
            info!("nothing to dispatch");
            write_json(out, &json!({ "dispatched": 0 }))
        }
        DispatchOutcome::Dispatched(batch) => {
            write_json(
                out,
                &json!({
                    "dispatched": batch.profile_ids.len(),
                    "profile_ids": batch.profile_ids,
                    "skipped": batch.skipped,
                    "job": to_json(&batch.job)?,
                }),
            )?;
            if batch.result.success {
                Ok(())
            } else {
                Err(miette::miette!(
                    "batch job {} failed: {}",
                    batch.job.id,
                    batch.job.error_message.as_deref().unwrap_or("unknown error")
                ))
            }
        }
    }
}

pub async fn scrape(
    scheduler: &Scheduler,
    profile_id: ProfileId,
    job_type: JobType,
    out: &mut impl Write,
) -> Result<()> {
    let run = scheduler
        .trigger_single(profile_id, job_type)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    report(&run, out)
}

pub async fn analyze(scheduler: &Scheduler, limit: u32, out: &mut impl Write) -> Result<()> {
    let run = scheduler
        .trigger_analysis(limit)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    report(&run, out)
}

pub async fn retry(scheduler: &Scheduler, job_id: JobId, out: &mut impl Write) -> Result<()> {
    let run = scheduler
        .retry_job(job_id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    report(&run, out)
}

pub fn list_jobs(
    store: &dyn Store,
    status: Option<JobStatus>,
    profile_id: Option<ProfileId>,
    limit: usize,
    out: &mut impl Write,
) -> Result<()> {
    let jobs = store
        .list_jobs(&JobFilter {
            status,
            profile_id,
            limit,
        })
        .map_err(|e| miette::miette!("{}", e))?;

    for job in &jobs {
        let mut value = to_json(job)?;
        value["duration_seconds"] = json!(job.duration_seconds());
        write_json(out, &value)?;
    }
    Ok(())
}

pub fn add_profile(
    store: &dyn Store,
    url: String,
    name: String,
    priority: i32,
    frequency: TrackingFrequency,
    out: &mut impl Write,
) -> Result<()> {
    let profile = NewProfile::new(url, name)
        .with_priority(priority)
        .with_frequency(frequency);
    let profile = store
        .insert_profile(&profile, Utc::now())
        .map_err(|e| miette::miette!("{}", e))?;
    write_json(out, &to_json(&profile)?)
}

pub fn list_profiles(store: &dyn Store, active_only: bool, out: &mut impl Write) -> Result<()> {
    let profiles = store
        .list_profiles(active_only)
        .map_err(|e| miette::miette!("{}", e))?;
    for profile in &profiles {
        write_json(out, &to_json(profile)?)?;
    }
    Ok(())
}

pub fn set_active(store: &dyn Store, id: ProfileId, active: bool) -> Result<()> {
    store
        .set_profile_active(id, active)
        .map_err(|e| miette::miette!("{}", e))?;
    info!(profile_id = id, active, "updated profile");
    Ok(())
}
