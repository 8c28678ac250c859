//! Execution backends.
//!
//! The dispatcher drives every backend through [`ExecutionBackend`]: start a
//! scenario, wait for it, and cancel it if it overruns its timeout. Backends
//! report spans through the [`SpanRecorder`] in the [`Launch`] and should poll
//! its [`CancellationToken`] at safe points.

mod in_process;
mod process;

pub use in_process::{InProcessBackend, ScenarioContext};
pub use process::{CommandSpec, ProcessBackend, parse_span_line};

use crate::cancel::CancellationToken;
use crate::collector::SpanRecorder;
use crate::error::ExecutionError;
use async_trait::async_trait;
use regress_proto::ScenarioId;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::warn;

/// Everything a backend needs to run one attempt of a scenario.
#[derive(Debug, Clone)]
pub struct Launch {
    pub scenario: ScenarioId,
    pub attempt: u32,
    pub descriptor: serde_json::Value,
    pub recorder: SpanRecorder,
    pub token: CancellationToken,
}

/// How an attempt ended, as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// A running attempt.
#[derive(Debug)]
pub struct ExecutionHandle {
    scenario: ScenarioId,
    task: Option<JoinHandle<BackendOutcome>>,
    outcome: Option<BackendOutcome>,
}

impl ExecutionHandle {
    /// Runs `work` on the tokio runtime.
    pub fn spawn<F>(scenario: ScenarioId, work: F) -> Self
    where
        F: Future<Output = BackendOutcome> + Send + 'static,
    {
        Self {
            scenario,
            task: Some(tokio::spawn(work)),
            outcome: None,
        }
    }

    pub fn scenario(&self) -> &ScenarioId {
        &self.scenario
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the attempt to end. Safe to call again after being
    /// interrupted by a timeout.
    pub async fn join(&mut self) -> BackendOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(task) = self.task.as_mut() else {
            return BackendOutcome::Cancelled;
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => BackendOutcome::Cancelled,
            Err(err) => {
                warn!(scenario = %self.scenario, error = %err, "Scenario task panicked");
                BackendOutcome::Failed(format!("scenario panicked: {err}"))
            }
        };
        self.task = None;
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Requests forced termination without waiting for it. A later
    /// [`join`](Self::join) resolves once the work future has been dropped,
    /// which also drops any child process it owns.
    pub fn abort(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Aborts the attempt and waits until its work has actually stopped.
    pub async fn terminate(&mut self) -> BackendOutcome {
        self.abort();
        self.join().await
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Capability interface implemented by every way of running a scenario.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Starts one attempt. Errors here mean the scenario never ran.
    async fn start(&self, launch: Launch) -> Result<ExecutionHandle, ExecutionError>;

    /// Waits for the attempt to end.
    async fn wait(&self, handle: &mut ExecutionHandle) -> BackendOutcome {
        handle.join().await
    }

    /// Forced termination, used once a timed-out scenario ignores its token.
    async fn cancel(&self, handle: &mut ExecutionHandle) {
        handle.terminate().await;
    }
}
