//! # regress-core
//!
//! Engine of the Regress scenario harness.
//!
//! Two halves feed each other:
//!
//! - the **executor** runs batches of scenarios concurrently under a resource
//!   budget, in priority order, with cooperative cancellation, hard timeouts
//!   and retries, collecting each scenario's spans as it runs;
//! - the **diff engine** rebuilds a span tree from those spans and compares it
//!   against a stored baseline, either exhaustively or stopping at the first
//!   difference.
//!
//! ```no_run
//! use regress_core::{
//!     Baseline, DiffOptions, Executor, ExecutorConfig, InProcessBackend, ResourceBudget,
//!     ScenarioTask,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = InProcessBackend::new().register("login", |ctx| async move {
//!     ctx.recorder.start_span("request", None).finish();
//!     Ok(())
//! });
//! let executor = Executor::new(ExecutorConfig::default(), Arc::new(backend));
//! let report = executor
//!     .submit(vec![ScenarioTask::new("login", "login".into())], ResourceBudget::units(4))?
//!     .collect()
//!     .await;
//!
//! let baseline = Baseline::load("baselines/login.json")?;
//! let diff = regress_core::diff(&baseline, &report.results[0], &DiffOptions::default())?;
//! assert!(diff.identical);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod baseline;
pub mod cancel;
pub mod collector;
pub mod config;
pub mod diff;
pub mod error;
pub mod executor;
pub mod logging;
pub mod queue;
pub mod resources;
pub mod tree;

pub use backend::{
    BackendOutcome, CommandSpec, ExecutionBackend, ExecutionHandle, InProcessBackend, Launch,
    ProcessBackend, ScenarioContext,
};
pub use baseline::Baseline;
pub use cancel::CancellationToken;
pub use collector::{ActiveSpan, SpanCollector, SpanRecorder};
pub use config::{DiffConfig, ExecutorConfig, HarnessConfig};
pub use diff::{DiffItem, DiffOptions, DiffResult, DiffSummary, DurationTolerance, SpanKey};
pub use error::{ConfigError, ExecutionError, QueueError, StructuralError, TraceError};
pub use executor::{
    ExecutionResult, Executor, RetryDecision, RetryPolicy, RunHandle, RunProgress, RunReport,
    ScenarioTask, StatusCounts,
};
pub use queue::{QueuedEntry, ScenarioQueue};
pub use resources::{ResourceBudget, ResourceGuard, ResourceManager, ResourceUsage};
pub use tree::SpanTree;

pub use regress_proto::{
    Priority, ResourceRequirement, ScenarioId, Span, SpanId, SpanStatus, TaskStatus,
};

/// Compares an execution's spans against a baseline, reporting every difference.
pub fn diff(
    baseline: &Baseline,
    current: &ExecutionResult,
    options: &DiffOptions,
) -> Result<DiffResult, TraceError> {
    baseline.diff(current, options)
}

/// Returns the first difference [`diff()`] would report, stopping as soon as it is found.
pub fn find_first_failure(
    baseline: &Baseline,
    current: &ExecutionResult,
    options: &DiffOptions,
) -> Result<Option<DiffItem>, TraceError> {
    baseline.first_failure(current, options)
}
