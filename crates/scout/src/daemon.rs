//! Daemon command for running the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::info;

use scout_scheduler::{Scheduler, SchedulerConfig};
use scout_store::SqliteStore;
use scout_workflow::{ProcessExecutor, WorkflowConfig};

use crate::commands::claim_ttl;

/// Scheduler name used by the daemon, stable across restarts so a new
/// daemon recovers the work of the one before it.
pub const DAEMON_INSTANCE: &str = "daemon";

/// Run the scheduler until Ctrl-C.
///
/// Jobs left unfinished by a previous daemon are failed first; runs started
/// by live CLI commands are left alone. On Ctrl-C the batch in flight runs
/// to completion and no new cycle starts.
pub async fn run(
    store: Arc<SqliteStore>,
    workflow: WorkflowConfig,
    check_interval: u64,
    batch_size: usize,
) -> Result<()> {
    if batch_size == 0 {
        return Err(miette::miette!("--batch-size must be at least 1"));
    }

    let config = SchedulerConfig::default()
        .with_check_interval(Duration::from_secs(check_interval))
        .with_batch_size(batch_size)
        .with_instance(DAEMON_INSTANCE)
        .with_claim_ttl(claim_ttl(&workflow));

    info!(
        program = %workflow.program,
        check_interval,
        batch_size,
        "starting scout daemon"
    );

    let scheduler = Arc::new(Scheduler::new(
        store,
        Arc::new(ProcessExecutor::new(workflow)),
        config,
    ));

    scheduler
        .recover_interrupted()
        .map_err(|e| miette::miette!("{}", e))?;

    // Handle shutdown signals
    let signal_scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        signal_scheduler.stop();
    });

    scheduler
        .start()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!("scout daemon stopped");
    Ok(())
}
