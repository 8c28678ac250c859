//! Bookkeeping for one submitted run.

use crate::cancel::CancellationToken;
use crate::executor::{ExecutionResult, ScenarioTask};
use regress_proto::{ScenarioId, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Number of tasks in each lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn of(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Queued => self.queued,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::TimedOut => self.timed_out,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.finished()
    }

    /// Tasks in a terminal state.
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.timed_out + self.cancelled
    }

    fn bump(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Queued => &mut self.queued,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::TimedOut => &mut self.timed_out,
            TaskStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }
}

impl FromIterator<TaskStatus> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut counts = Self::default();
        for status in iter {
            counts.bump(status);
        }
        counts
    }
}

/// Mutable state shared by the dispatcher, workers and the run handle.
#[derive(Debug)]
pub(crate) struct RunState {
    /// Submission order, for stable reporting.
    pub order: Vec<ScenarioId>,
    pub statuses: HashMap<ScenarioId, TaskStatus>,
    pub tokens: HashMap<ScenarioId, CancellationToken>,
    /// Task the dispatcher has dequeued and is waiting to grant resources to.
    pub admitting: Option<ScenarioId>,
    /// Tasks without a final result yet.
    pub outstanding: usize,
    pub cancelling_all: bool,
    /// Dropped once the last result is sent, which ends the result stream.
    pub results: Option<mpsc::UnboundedSender<ExecutionResult>>,
}

impl RunState {
    pub fn new(tasks: &[ScenarioTask], results: mpsc::UnboundedSender<ExecutionResult>) -> Self {
        let order: Vec<ScenarioId> = tasks.iter().map(|t| t.id.clone()).collect();
        let statuses = order
            .iter()
            .map(|id| (id.clone(), TaskStatus::Queued))
            .collect();
        let tokens = order
            .iter()
            .map(|id| (id.clone(), CancellationToken::new()))
            .collect();
        Self {
            outstanding: order.len(),
            order,
            statuses,
            tokens,
            admitting: None,
            cancelling_all: false,
            results: (!tasks.is_empty()).then_some(results),
        }
    }

    pub fn set_status(&mut self, id: &ScenarioId, status: TaskStatus) {
        if let Some(slot) = self.statuses.get_mut(id) {
            *slot = status;
        }
    }

    pub fn status(&self, id: &ScenarioId) -> Option<TaskStatus> {
        self.statuses.get(id).copied()
    }

    pub fn token(&self, id: &ScenarioId) -> CancellationToken {
        self.tokens.get(id).cloned().unwrap_or_default()
    }

    pub fn counts(&self) -> StatusCounts {
        self.statuses.values().copied().collect()
    }

    /// Ids in `status`, in submission order.
    pub fn ids_with(&self, status: TaskStatus) -> Vec<ScenarioId> {
        self.order
            .iter()
            .filter(|id| self.status(id) == Some(status))
            .cloned()
            .collect()
    }

    /// Records a final result and sends it. Returns true if this was the last one.
    pub fn finish(&mut self, result: ExecutionResult) -> bool {
        self.set_status(&result.scenario_id, result.status);
        self.outstanding = self.outstanding.saturating_sub(1);
        if let Some(results) = &self.results {
            // The receiver may already be gone; the run still has to drain.
            let _ = results.send(result);
        }
        if self.outstanding == 0 {
            self.results = None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tasks(ids: &[&str]) -> Vec<ScenarioTask> {
        ids.iter()
            .map(|id| ScenarioTask::new(*id, json!(null)))
            .collect()
    }

    #[test]
    fn test_counts_follow_status_changes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut state = RunState::new(&tasks(&["a", "b", "c"]), tx);
        state.set_status(&ScenarioId::new("b"), TaskStatus::Running);

        let counts = state.counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(
            state.ids_with(TaskStatus::Queued),
            vec![ScenarioId::new("a"), ScenarioId::new("c")]
        );
    }

    #[test]
    fn test_last_finish_closes_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task_list = tasks(&["a", "b"]);
        let mut state = RunState::new(&task_list, tx);

        assert!(!state.finish(ExecutionResult::cancelled(&task_list[0])));
        assert!(state.finish(ExecutionResult::cancelled(&task_list[1])));
        assert!(state.results.is_none());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(state.counts().cancelled, 2);
    }

    #[test]
    fn test_empty_run_has_no_sender() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let state = RunState::new(&[], tx);
        assert!(state.results.is_none());
        assert_eq!(state.outstanding, 0);
    }
}
