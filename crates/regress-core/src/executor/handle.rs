//! Caller-side view of a running batch.

use super::Shared;
use super::run_state::StatusCounts;
use super::task::ExecutionResult;
use crate::resources::ResourceUsage;
use futures::Stream;
use regress_proto::{ScenarioId, TaskStatus};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub counts: StatusCounts,
    pub usage: ResourceUsage,
    /// Highest number of units held at once so far.
    pub peak_units: u32,
    /// Running scenarios, in submission order.
    pub running: Vec<ScenarioId>,
    /// Waiting scenarios, in the order they will be admitted.
    pub queued: Vec<ScenarioId>,
}

/// Every result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Results in completion order.
    pub results: Vec<ExecutionResult>,
    pub counts: StatusCounts,
    pub wall_time: Duration,
}

impl RunReport {
    /// Completed share of all results. An empty run counts as fully successful.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.counts.completed as f64 / self.results.len() as f64;
        rate
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(ExecutionResult::is_success)
    }

    pub fn result(&self, id: &ScenarioId) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| &r.scenario_id == id)
    }
}

/// Stream of results for one submitted batch, plus run control.
///
/// Dropping the handle before the run ends cancels the remaining scenarios.
pub struct RunHandle {
    shared: Arc<Shared>,
    results: mpsc::UnboundedReceiver<ExecutionResult>,
    started: Instant,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("counts", &self.shared.state().counts())
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        results: mpsc::UnboundedReceiver<ExecutionResult>,
    ) -> Self {
        Self {
            shared,
            results,
            started: Instant::now(),
        }
    }

    /// Next finished result, or `None` once every scenario has reported.
    pub async fn next_result(&mut self) -> Option<ExecutionResult> {
        self.results.recv().await
    }

    pub fn progress(&self) -> RunProgress {
        let state = self.shared.state();
        let mut queued: Vec<ScenarioId> = state.admitting.iter().cloned().collect();
        queued.extend(self.shared.queue.snapshot().into_iter().map(|e| e.id));
        RunProgress {
            counts: state.counts(),
            usage: self.shared.resources.usage(),
            peak_units: self.shared.resources.peak_units(),
            running: state.ids_with(TaskStatus::Running),
            queued,
        }
    }

    /// Cancels one scenario. Returns false if it is unknown or already finished.
    pub fn cancel(&self, id: &ScenarioId) -> bool {
        self.shared.cancel(id)
    }

    pub fn cancel_all(&self) {
        self.shared.cancel_all();
    }

    /// True once every scenario has a final result.
    pub fn is_finished(&self) -> bool {
        self.shared.state().outstanding == 0
    }

    /// Waits for every scenario and gathers the results.
    pub async fn collect(mut self) -> RunReport {
        let mut results = Vec::new();
        while let Some(result) = self.next_result().await {
            results.push(result);
        }
        let counts = results.iter().map(|r| r.status).collect();
        RunReport {
            results,
            counts,
            wall_time: self.started.elapsed(),
        }
    }
}

impl Stream for RunHandle {
    type Item = ExecutionResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().results.poll_recv(cx)
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.shared.cancel_all();
        }
    }
}
