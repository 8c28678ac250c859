//! Error types for execution, trace handling, and configuration.
//!
//! Execution errors are recoverable per task: they end up inside a failed
//! [`ExecutionResult`](crate::ExecutionResult) while the pool keeps draining the
//! queue. Trace errors are returned directly from the diff entry points.

use regress_proto::{ScenarioId, SpanId};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Task-level execution failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    /// The requirement exceeds the total budget, or waiting for it timed out.
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// The backend reported an error outcome.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The hard timeout elapsed and the scenario was terminated.
    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// The scenario was cancelled before it finished.
    #[error("Execution cancelled")]
    Cancelled,

    /// Two tasks in one submission share an id.
    #[error("Duplicate scenario id in submission: {0}")]
    DuplicateScenario(ScenarioId),
}

impl ExecutionError {
    /// Returns true if a retry policy may re-run the task after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::ExecutionFailed(_))
    }
}

/// Malformed span parentage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    /// Following parent links from this span leads back to it.
    #[error("span {span_id} is its own ancestor")]
    Cycle { span_id: SpanId },

    /// Span ids must be unique within one execution.
    #[error("span id {span_id} appears more than once")]
    DuplicateSpan { span_id: SpanId },
}

/// Failures while building or loading traces for comparison.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    /// The baseline is absent or cannot be parsed. Fatal for the diff call.
    #[error("Malformed baseline: {0}")]
    MalformedBaseline(String),
}

/// The queue no longer accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is shut down")]
    Closed,
}

/// Errors loading harness configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid attribute ignore pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
