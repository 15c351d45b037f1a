//! Process-spawning workflow executor.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use scout_store::ProfileId;

use crate::output::{preview, truncate_output};
use crate::report::parse_report;
use crate::{ExecutionResult, WorkflowError, WorkflowExecutor, WorkflowOperation};

/// Default batch timeout (10 minutes).
const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 600;

/// Default single-profile timeout (5 minutes).
const DEFAULT_SINGLE_TIMEOUT_SECS: u64 = 300;

/// Default analysis timeout (10 minutes).
const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 600;

/// Default cap on captured bytes per stream.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// How long to wait for pipes to close after the process exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How to launch the workflow.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Program to run.
    pub program: String,
    /// Arguments placed before the operation selector.
    pub args: Vec<String>,
    /// Working directory; inherited when `None`.
    pub working_dir: Option<PathBuf>,
    pub batch_timeout: Duration,
    pub single_timeout: Duration,
    pub analysis_timeout: Duration,
    /// Bytes kept from each of stdout and stderr.
    pub max_output_bytes: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["tsx".to_string(), "src/workflow-tracker.ts".to_string()],
            working_dir: None,
            batch_timeout: Duration::from_secs(DEFAULT_BATCH_TIMEOUT_SECS),
            single_timeout: Duration::from_secs(DEFAULT_SINGLE_TIMEOUT_SECS),
            analysis_timeout: Duration::from_secs(DEFAULT_ANALYSIS_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl WorkflowConfig {
    /// Run `program` with `args` in front of every operation.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_single_timeout(mut self, timeout: Duration) -> Self {
        self.single_timeout = timeout;
        self
    }

    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// The largest of the per-operation timeouts.
    pub fn longest_timeout(&self) -> Duration {
        self.batch_timeout
            .max(self.single_timeout)
            .max(self.analysis_timeout)
    }

    fn timeout_for(&self, op: &WorkflowOperation) -> Duration {
        match op {
            WorkflowOperation::Batch(_) => self.batch_timeout,
            WorkflowOperation::Scrape(_) => self.single_timeout,
            WorkflowOperation::Analyze(_) => self.analysis_timeout,
        }
    }
}

/// Output of a process that was spawned, whether or not it finished.
struct Captured {
    /// The exit status, or why the process was not waited to completion.
    status: Result<ExitStatus, WorkflowError>,
    stdout: String,
    stderr: String,
}

/// Runs the workflow as a child process.
///
/// The child inherits the caller's environment. It is killed when it
/// exceeds the operation's timeout, and when the executing future is dropped.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    config: WorkflowConfig,
}

impl ProcessExecutor {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run one operation and fold every outcome into an [`ExecutionResult`].
    #[tracing::instrument(skip(self, op), fields(op = op.name()))]
    pub async fn execute(&self, op: WorkflowOperation) -> ExecutionResult {
        let limit = self.config.timeout_for(&op);
        let started = Instant::now();
        info!(%op, timeout_ms = limit.as_millis() as u64, "running workflow");

        let result = match self.run(&op, limit).await {
            Ok(captured) => self.interpret(&op, captured),
            Err(e) => {
                error!(%op, error = %e, "workflow did not complete");
                ExecutionResult::from_error(&e, "")
            }
        };

        result.with_elapsed(started.elapsed())
    }

    async fn run(
        &self,
        op: &WorkflowOperation,
        limit: Duration,
    ) -> Result<Captured, WorkflowError> {
        let argument = op.argument()?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(op.name())
            .arg(&argument)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(command = ?cmd, "spawning workflow process");
        let mut child = cmd.spawn().map_err(WorkflowError::Launch)?;

        // Drain both pipes while waiting so a chatty child never blocks on a full pipe.
        let cap = self.config.max_output_bytes;
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(drain(out, cap)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(drain(err, cap)));

        let status = match timeout(limit, child.wait()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => {
                if let Err(kill) = child.start_kill() {
                    debug!(error = %kill, "failed to signal workflow after wait error");
                }
                Err(WorkflowError::Wait(e))
            }
            Err(_) => {
                // Kill and reap so no zombie is left behind.
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed out workflow");
                }
                Err(WorkflowError::Timeout(limit))
            }
        };

        // Pipes close once the child is gone; what it wrote so far is kept.
        Ok(Captured {
            status,
            stdout: collect(stdout_task).await,
            stderr: collect(stderr_task).await,
        })
    }

    fn interpret(&self, op: &WorkflowOperation, captured: Captured) -> ExecutionResult {
        let cap = self.config.max_output_bytes;
        let output = combine(&captured.stdout, &captured.stderr, cap);

        let status = match captured.status {
            Ok(status) => status,
            Err(e) => {
                error!(%op, error = %e, output = preview(&output), "workflow did not complete");
                return ExecutionResult::from_error(&e, output);
            }
        };

        if status.success() {
            if !captured.stderr.trim().is_empty() {
                debug!(stderr = preview(&captured.stderr), "workflow stderr");
            }
            let counts = parse_report(&captured.stdout);
            info!(
                %op,
                items = counts.items_scraped,
                new_items = counts.new_items_found,
                output = preview(&captured.stdout),
                "workflow completed"
            );
            return ExecutionResult::succeeded(output, counts);
        }

        let message = failure_message(status, &captured.stderr, cap);
        error!(%op, error = preview(&message), "workflow failed");
        ExecutionResult::from_error(&WorkflowError::Exit(message), output)
    }
}

#[async_trait]
impl WorkflowExecutor for ProcessExecutor {
    async fn run_batch(&self, profile_ids: &[ProfileId]) -> ExecutionResult {
        self.execute(WorkflowOperation::Batch(profile_ids.to_vec()))
            .await
    }

    async fn run_single(&self, profile_id: ProfileId) -> ExecutionResult {
        self.execute(WorkflowOperation::Scrape(profile_id)).await
    }

    async fn run_analysis(&self, limit: u32) -> ExecutionResult {
        self.execute(WorkflowOperation::Analyze(limit)).await
    }
}

/// Read a stream to EOF, keeping one byte past `cap` so truncation is detectable.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let cap = cap.saturating_add(1);
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                debug!(error = %e, "stopped reading workflow output");
                break;
            }
        }
    }
    kept
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };

    // A grandchild may still hold the pipe open after the child exits.
    match timeout(OUTPUT_DRAIN_GRACE, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "workflow output reader failed");
            String::new()
        }
        Err(_) => {
            task.abort();
            warn!("workflow output still open after exit, discarding");
            String::new()
        }
    }
}

fn combine(stdout: &str, stderr: &str, cap: usize) -> String {
    let stdout = truncate_output(stdout, cap);
    if stderr.trim().is_empty() {
        return stdout;
    }
    format!("{stdout}\n[stderr]\n{}", truncate_output(stderr, cap))
}

fn failure_message(status: ExitStatus, stderr: &str, cap: usize) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate_output(stderr, cap);
    }
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
