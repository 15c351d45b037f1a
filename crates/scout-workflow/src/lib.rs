//! The boundary between Scout and the external collection workflow.
//!
//! The scheduler never spawns processes itself. It talks to a
//! [`WorkflowExecutor`], which reports every outcome (success, non-zero
//! exit, launch failure, timeout) as an [`ExecutionResult`] value.
//! [`ProcessExecutor`] is the production implementation.

mod error;
mod executor;
mod output;
mod process;
mod report;

pub use error::WorkflowError;
pub use executor::{ExecutionResult, WorkflowExecutor, WorkflowOperation};
pub use output::{LOG_PREVIEW_CHARS, preview, truncate_output};
pub use process::{ProcessExecutor, WorkflowConfig};
pub use report::parse_report;
