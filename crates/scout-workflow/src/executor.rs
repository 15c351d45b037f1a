//! Workflow executor abstraction.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use scout_store::{JobCounts, ProfileId};

use crate::WorkflowError;

/// One invocation of the external workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOperation {
    /// Collect several profiles in one process.
    Batch(Vec<ProfileId>),
    /// Collect exactly one profile.
    Scrape(ProfileId),
    /// Classify up to `limit` collected items that have not been analyzed.
    Analyze(u32),
}

impl WorkflowOperation {
    /// Operation selector passed as the first workflow argument.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::Scrape(_) => "scrape",
            Self::Analyze(_) => "analyze",
        }
    }

    /// Operation argument passed after the selector.
    ///
    /// Batches are encoded as a JSON array of ids.
    pub fn argument(&self) -> Result<String, WorkflowError> {
        Ok(match self {
            Self::Batch(ids) => serde_json::to_string(ids)?,
            Self::Scrape(id) => id.to_string(),
            Self::Analyze(limit) => limit.to_string(),
        })
    }
}

impl fmt::Display for WorkflowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch(ids) => write!(f, "batch of {} profiles", ids.len()),
            Self::Scrape(id) => write!(f, "scrape of profile {id}"),
            Self::Analyze(limit) => write!(f, "analysis of up to {limit} items"),
        }
    }
}

/// Outcome of one workflow invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// True iff the process exited with code 0.
    pub success: bool,
    /// Captured stdout and stderr, bounded.
    pub output: String,
    /// Failure detail; always set when `success` is false.
    pub error: Option<String>,
    /// Whether the process was killed for exceeding its timeout.
    pub timed_out: bool,
    /// Counters parsed from the workflow's summary, zero when absent.
    pub counts: JobCounts,
    /// Wall-clock time spent in the workflow.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// A successful run.
    pub fn succeeded(output: impl Into<String>, counts: JobCounts) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            timed_out: false,
            counts,
            elapsed: Duration::ZERO,
        }
    }

    /// A failed run with a plain error message.
    pub fn failed(error: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            timed_out: false,
            counts: JobCounts::default(),
            elapsed: Duration::ZERO,
        }
    }

    /// A failed run built from a workflow error.
    pub fn from_error(error: &WorkflowError, output: impl Into<String>) -> Self {
        let mut result = Self::failed(error.to_string(), output);
        result.timed_out = error.is_timeout();
        result
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Runs the external collection workflow.
///
/// Implementations never return errors: every failure is reported through
/// [`ExecutionResult`].
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Collect several profiles in one invocation.
    async fn run_batch(&self, profile_ids: &[ProfileId]) -> ExecutionResult;

    /// Collect a single profile.
    async fn run_single(&self, profile_id: ProfileId) -> ExecutionResult;

    /// Analyze up to `limit` unanalyzed items.
    async fn run_analysis(&self, limit: u32) -> ExecutionResult;
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
