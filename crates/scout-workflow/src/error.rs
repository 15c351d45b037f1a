//! Error types for workflow execution.

use std::time::Duration;

use thiserror::Error;

/// Ways a workflow invocation can fail.
///
/// These never escape the executor; they are folded into
/// [`ExecutionResult`](crate::ExecutionResult) as an error message.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The process could not be spawned.
    #[error("failed to launch workflow: {0}")]
    Launch(#[source] std::io::Error),

    /// Waiting on the spawned process failed.
    #[error("failed to wait for workflow: {0}")]
    Wait(#[source] std::io::Error),

    /// The process exited unsuccessfully.
    #[error("{0}")]
    Exit(String),

    /// The process exceeded its time budget and was killed.
    #[error("timeout after {}", display_limit(.0))]
    Timeout(Duration),

    /// Arguments could not be encoded.
    #[error("invalid workflow arguments: {0}")]
    Arguments(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Whole seconds as `30s`, whole milliseconds as `250ms`.
fn display_limit(limit: &Duration) -> String {
    if limit.subsec_nanos() == 0 {
        format!("{}s", limit.as_secs())
    } else if limit.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", limit.as_millis())
    } else {
        format!("{limit:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_keeps_sub_second_limits() {
        let message = |limit| WorkflowError::Timeout(limit).to_string();
        assert_eq!(message(Duration::from_secs(600)), "timeout after 600s");
        assert_eq!(message(Duration::from_millis(250)), "timeout after 250ms");
        assert_eq!(message(Duration::from_millis(1500)), "timeout after 1500ms");
        assert_eq!(message(Duration::from_micros(20)), "timeout after 20µs");
    }
}
