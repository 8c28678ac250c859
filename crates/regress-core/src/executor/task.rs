//! Submitted work and its final outcome.

use crate::error::ExecutionError;
use regress_proto::{Priority, ResourceRequirement, ScenarioId, Span, TaskStatus};
use serde::Serialize;
use std::time::Duration;

/// One scenario to run.
///
/// The descriptor is opaque to the dispatcher and only interpreted by the
/// execution backend. Status and attempt count are owned by the dispatcher.
#[derive(Debug, Clone)]
pub struct ScenarioTask {
    pub id: ScenarioId,
    pub priority: Priority,
    pub requirement: ResourceRequirement,
    pub descriptor: serde_json::Value,
    /// Hard timeout for this task; the executor default applies when unset.
    pub timeout: Option<Duration>,
    pub(crate) attempt: u32,
    pub(crate) status: TaskStatus,
}

impl ScenarioTask {
    pub fn new(id: impl Into<ScenarioId>, descriptor: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            priority: Priority::default(),
            requirement: ResourceRequirement::default(),
            descriptor,
            timeout: None,
            attempt: 1,
            status: TaskStatus::Queued,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirement(mut self, requirement: ResourceRequirement) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 1-based attempt number of the current or most recent run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }
}

/// Final outcome of one scenario. Never mutated after it is emitted.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub scenario_id: ScenarioId,
    pub status: TaskStatus,
    /// Number of attempts made, including the final one.
    pub attempts: u32,
    /// Wall time of the final attempt.
    pub duration: Duration,
    pub spans: Vec<Span>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub(crate) fn cancelled(task: &ScenarioTask) -> Self {
        Self {
            scenario_id: task.id.clone(),
            status: TaskStatus::Cancelled,
            attempts: task.attempt.saturating_sub(1),
            duration: Duration::ZERO,
            spans: Vec::new(),
            error: Some(ExecutionError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_task_defaults() {
        let task = ScenarioTask::new("login", json!({"entry": "login"}));
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.requirement.units, 1);
        assert_eq!(task.attempt(), 1);
        assert_eq!(task.status(), TaskStatus::Queued);
        assert!(task.timeout.is_none());
    }

    #[test]
    fn test_cancelled_before_start_counts_no_attempts() {
        let task = ScenarioTask::new("idle", json!(null));
        let result = ExecutionResult::cancelled(&task);
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.error, Some(ExecutionError::Cancelled));
    }

    #[test]
    fn test_result_serializes_without_empty_error() {
        let result = ExecutionResult {
            scenario_id: ScenarioId::new("ok"),
            status: TaskStatus::Completed,
            attempts: 1,
            duration: Duration::from_millis(5),
            spans: Vec::new(),
            error: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "completed");
        assert!(value.get("error").is_none());
    }
}
