//! Priority queue of pending scenarios.
//!
//! Tasks are ordered by tier, then by arrival. With aging enabled a task that
//! has waited `k` aging intervals is served as if it were `k` tiers higher; it
//! keeps its arrival number so it lines up behind older work of that tier.

use crate::error::QueueError;
use crate::executor::ScenarioTask;
use regress_proto::{Priority, ScenarioId};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// `(rank, arrival)`: lowest sorts first.
type QueueKey = (u8, u64);

#[derive(Debug)]
struct Entry {
    task: ScenarioTask,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<QueueKey, Entry>,
    next_seq: u64,
    closed: bool,
}

/// Snapshot row returned by [`ScenarioQueue::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    pub id: ScenarioId,
    /// Tier the task was submitted with.
    pub priority: Priority,
    /// Tier it is currently served at; differs from `priority` only after aging.
    pub effective: Priority,
}

#[derive(Debug, Default)]
pub struct ScenarioQueue {
    state: Mutex<State>,
    arrived: Notify,
    aging: Option<Duration>,
}

impl ScenarioQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that promotes waiting tasks one tier per `interval`.
    pub fn with_aging(interval: Duration) -> Self {
        Self {
            aging: Some(interval).filter(|i| !i.is_zero()),
            ..Self::default()
        }
    }

    pub fn enqueue(&self, task: ScenarioTask) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            debug!(scenario = %task.id, priority = %task.priority, seq, "Enqueued scenario");
            state.entries.insert(
                (task.priority.rank(), seq),
                Entry {
                    task,
                    enqueued_at: Instant::now(),
                },
            );
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    /// Waits for the next task. Returns `None` once the queue is shut down and drained.
    pub async fn dequeue_next(&self) -> Option<ScenarioTask> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(task) = self.pop(&mut state) {
                    return Some(task);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<ScenarioTask> {
        let mut state = self.state();
        self.pop(&mut state)
    }

    /// Removes a pending task by id.
    pub fn remove(&self, id: &ScenarioId) -> Option<ScenarioTask> {
        let mut state = self.state();
        let key = state
            .entries
            .iter()
            .find(|(_, entry)| &entry.task.id == id)
            .map(|(key, _)| *key)?;
        state.entries.remove(&key).map(|entry| entry.task)
    }

    /// Pending tasks in the order they would be dequeued now.
    pub fn snapshot(&self) -> Vec<QueuedEntry> {
        let mut state = self.state();
        self.promote(&mut state);
        state
            .entries
            .iter()
            .map(|((rank, _), entry)| QueuedEntry {
                id: entry.task.id.clone(),
                priority: entry.task.priority,
                effective: Priority::from_rank(*rank),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Stops accepting new work. Already queued tasks can still be dequeued.
    pub fn shutdown(&self) {
        self.state().closed = true;
        self.arrived.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn pop(&self, state: &mut State) -> Option<ScenarioTask> {
        self.promote(state);
        state.entries.pop_first().map(|(_, entry)| entry.task)
    }

    fn promote(&self, state: &mut State) {
        let Some(interval) = self.aging else {
            return;
        };
        let now = Instant::now();
        let promoted: Vec<(QueueKey, u8)> = state
            .entries
            .iter()
            .filter_map(|(&(rank, seq), entry)| {
                let waited = now.saturating_duration_since(entry.enqueued_at);
                let tiers = u64::try_from(waited.as_nanos() / interval.as_nanos())
                    .unwrap_or(u64::MAX);
                let effective = entry.task.priority.promoted_by(tiers).rank();
                (effective < rank).then_some(((rank, seq), effective))
            })
            .collect();

        for (key, rank) in promoted {
            if let Some(entry) = state.entries.remove(&key) {
                debug!(
                    scenario = %entry.task.id,
                    from = %Priority::from_rank(key.0),
                    to = %Priority::from_rank(rank),
                    "Promoted waiting scenario"
                );
                state.entries.insert((rank, key.1), entry);
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
