//! Scenario identity, scheduling tiers, lifecycle states, and resource needs.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of a scenario, unique within one submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(String);

impl ScenarioId {
    /// Creates a scenario id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScenarioId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ScenarioId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Scheduling tier. `High` sorts greater than `Normal`, which sorts greater than `Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Dequeue rank: 0 is served first.
    pub const fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Inverse of [`Priority::rank`]. Ranks past the lowest tier clamp to `Low`.
    pub const fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    /// Moves up by `tiers`, saturating at `High`.
    pub fn promoted_by(self, tiers: u64) -> Self {
        let tiers = u8::try_from(tiers).unwrap_or(u8::MAX);
        Self::from_rank(self.rank().saturating_sub(tiers))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a scenario task.
///
/// `Queued -> Running -> {Completed | Failed | TimedOut | Cancelled}`. A failed
/// attempt that is retried goes back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    /// Returns true once no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }

    /// Returns true only for `Completed`.
    pub fn is_success(self) -> bool {
        self == TaskStatus::Completed
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Resources a scenario holds for the whole time it runs.
///
/// Every running scenario occupies at least one concurrency unit; a
/// requirement of zero units is treated as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirement {
    pub units: u32,
    pub memory_mb: u64,
    pub cpu_millis: u32,
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            units: 1,
            memory_mb: 0,
            cpu_millis: 0,
        }
    }
}

impl ResourceRequirement {
    /// A requirement of `units` concurrency slots and nothing else.
    pub fn units(units: u32) -> Self {
        Self {
            units,
            ..Self::default()
        }
    }

    /// Sets the memory requirement in megabytes.
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Sets the CPU requirement in millicores.
    pub fn with_cpu_millis(mut self, cpu_millis: u32) -> Self {
        self.cpu_millis = cpu_millis;
        self
    }

    /// Concurrency units actually charged against a budget.
    pub fn effective_units(&self) -> u32 {
        self.units.max(1)
    }
}

impl fmt::Display for ResourceRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "units={} memory={}MB cpu={}m",
            self.effective_units(),
            self.memory_mb,
            self.cpu_millis
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);

        let mut tiers = vec![Priority::Low, Priority::High, Priority::Normal];
        tiers.sort_by(|a, b| b.cmp(a));
        assert_eq!(tiers, Priority::ALL.to_vec());
    }

    #[test]
    fn test_priority_promotion_saturates() {
        assert_eq!(Priority::Low.promoted_by(0), Priority::Low);
        assert_eq!(Priority::Low.promoted_by(1), Priority::Normal);
        assert_eq!(Priority::Low.promoted_by(7), Priority::High);
        assert_eq!(Priority::High.promoted_by(u64::MAX), Priority::High);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::TimedOut.is_terminal());
        assert!(TaskStatus::Completed.is_success());
        assert!(!TaskStatus::Cancelled.is_success());
    }

    #[test]
    fn test_zero_units_charge_one() {
        let req = ResourceRequirement::units(0);
        assert_eq!(req.effective_units(), 1);
        assert_eq!(req.to_string(), "units=1 memory=0MB cpu=0m");
    }

    #[test]
    fn test_requirement_json_defaults() {
        let req: ResourceRequirement = serde_json::from_str(r#"{"memory_mb": 256}"#).unwrap();
        assert_eq!(req.units, 1);
        assert_eq!(req.memory_mb, 256);
        assert_eq!(req.cpu_millis, 0);
    }
}
