//! Worker pool and dispatcher.
//!
//! A submitted batch goes into a [`ScenarioQueue`]. One dispatcher task pulls
//! the next scenario, waits until the [`ResourceManager`] can grant its whole
//! requirement, marks it running and hands it to a worker. Workers drive the
//! execution backend, enforce the hard timeout, release resources and then
//! either requeue the scenario for a retry or report its final result.
//!
//! Admission is strictly in queue order: while the head scenario waits for
//! resources, nothing behind it is started.

mod handle;
mod retry;
mod run_state;
mod task;

pub use handle::{RunHandle, RunProgress, RunReport};
pub use retry::{RetryDecision, RetryPolicy};
pub use run_state::StatusCounts;
pub use task::{ExecutionResult, ScenarioTask};

use crate::backend::{BackendOutcome, ExecutionBackend, ExecutionHandle, Launch};
use crate::cancel::CancellationToken;
use crate::collector::SpanCollector;
use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::queue::ScenarioQueue;
use crate::resources::{ResourceBudget, ResourceGuard, ResourceManager};
use regress_proto::{ScenarioId, TaskStatus};
use run_state::RunState;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runs batches of scenarios on one execution backend.
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    backend: Arc<dyn ExecutionBackend>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Executor {
    pub fn new(config: ExecutorConfig, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Starts running `tasks` under the configured budget.
    pub fn run(&self, tasks: Vec<ScenarioTask>) -> Result<RunHandle, ExecutionError> {
        self.submit(tasks, self.config.budget)
    }

    /// Starts running `tasks` under `budget` and returns a handle that yields
    /// results as they finish.
    ///
    /// Must be called from within a tokio runtime. Fails without running
    /// anything if two tasks share an id.
    pub fn submit(
        &self,
        tasks: Vec<ScenarioTask>,
        budget: ResourceBudget,
    ) -> Result<RunHandle, ExecutionError> {
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(&task.id) {
                return Err(ExecutionError::DuplicateScenario(task.id.clone()));
            }
        }

        let queue = match self.config.aging() {
            Some(interval) => ScenarioQueue::with_aging(interval),
            None => ScenarioQueue::new(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let state = RunState::new(&tasks, tx);
        let count = tasks.len();

        for mut task in tasks {
            task.attempt = 1;
            task.status = TaskStatus::Queued;
            // A queue that was just created is never closed.
            let _ = queue.enqueue(task);
        }
        if count == 0 {
            queue.shutdown();
        }

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            resources: ResourceManager::new(budget),
            queue,
            state: Mutex::new(state),
        });
        info!(
            scenarios = count,
            backend = self.backend.name(),
            max_units = budget.max_units,
            "Submitted scenarios"
        );

        tokio::spawn(dispatch(Arc::clone(&shared)));
        Ok(RunHandle::new(shared, rx))
    }
}

/// Final status and error of one attempt.
type AttemptOutcome = (TaskStatus, Option<ExecutionError>);

/// State shared by the dispatcher, the workers and the [`RunHandle`].
pub(crate) struct Shared {
    config: ExecutorConfig,
    backend: Arc<dyn ExecutionBackend>,
    resources: Arc<ResourceManager>,
    queue: ScenarioQueue,
    state: Mutex<RunState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, id: &ScenarioId, status: TaskStatus) {
        debug!(scenario = %id, status = %status, "Scenario state changed");
        self.state().set_status(id, status);
    }

    /// Reports a final result. Exactly one call per task.
    fn finish(&self, result: ExecutionResult) {
        let status = result.status;
        let failed = matches!(status, TaskStatus::Failed | TaskStatus::TimedOut);
        let (last, fail_fast) = {
            let mut state = self.state();
            info!(
                scenario = %result.scenario_id,
                status = %status,
                attempts = result.attempts,
                duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                "Scenario finished"
            );
            let fail_fast = failed && self.config.fail_fast && !state.cancelling_all;
            (state.finish(result), fail_fast)
        };

        if last {
            self.queue.shutdown();
            info!("All scenarios finished");
        }
        if fail_fast {
            warn!("Fail-fast triggered, cancelling remaining scenarios");
            self.cancel_all();
        }
    }

    /// Cancels one scenario. Returns false if it is unknown or already final.
    pub(crate) fn cancel(&self, id: &ScenarioId) -> bool {
        let token = {
            let state = self.state();
            match state.status(id) {
                Some(status) if !status.is_terminal() => state.token(id),
                _ => return false,
            }
        };
        token.cancel();
        if let Some(task) = self.queue.remove(id) {
            debug!(scenario = %id, "Cancelled queued scenario");
            self.finish(ExecutionResult::cancelled(&task));
        }
        true
    }

    pub(crate) fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = {
            let mut state = self.state();
            state.cancelling_all = true;
            state.tokens.values().cloned().collect()
        };
        for token in tokens {
            token.cancel();
        }
        while let Some(task) = self.queue.try_dequeue() {
            self.finish(ExecutionResult::cancelled(&task));
        }
    }

    /// Starts an attempt. The start counts against the hard timeout and is
    /// abandoned if the scenario is cancelled first.
    async fn launch(
        &self,
        launch: Launch,
        token: &CancellationToken,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ExecutionHandle, AttemptOutcome> {
        let scenario = launch.scenario.clone();
        let start = tokio::time::timeout_at(deadline, self.backend.start(launch));
        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(scenario = %scenario, "Scenario cancelled while starting");
                Err((TaskStatus::Cancelled, Some(ExecutionError::Cancelled)))
            }
            started = start => match started {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(err)) => Err((TaskStatus::Failed, Some(err))),
                Err(_) => {
                    token.cancel();
                    warn!(
                        scenario = %scenario,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Scenario did not start within its timeout"
                    );
                    Err((
                        TaskStatus::TimedOut,
                        Some(ExecutionError::ExecutionTimeout(timeout)),
                    ))
                }
            },
        }
    }

    /// Waits for an attempt, enforcing the hard timeout.
    async fn supervise(
        &self,
        handle: &mut ExecutionHandle,
        token: &CancellationToken,
        deadline: Instant,
        timeout: Duration,
    ) -> AttemptOutcome {
        let Ok(outcome) = tokio::time::timeout_at(deadline, self.backend.wait(handle)).await else {
            let cancelled_earlier = token.is_cancelled();
            token.cancel();
            warn!(
                scenario = %handle.scenario(),
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Scenario exceeded its timeout, cancelling"
            );

            let grace = self.config.cancel_grace();
            if tokio::time::timeout(grace, self.backend.wait(handle)).await.is_err() {
                warn!(scenario = %handle.scenario(), "Scenario ignored cancellation, terminating");
                self.backend.cancel(handle).await;
                handle.terminate().await;
            }
            return if cancelled_earlier {
                (TaskStatus::Cancelled, Some(ExecutionError::Cancelled))
            } else {
                (
                    TaskStatus::TimedOut,
                    Some(ExecutionError::ExecutionTimeout(timeout)),
                )
            };
        };

        match outcome {
            BackendOutcome::Succeeded => (TaskStatus::Completed, None),
            BackendOutcome::Failed(_) | BackendOutcome::Cancelled if token.is_cancelled() => {
                (TaskStatus::Cancelled, Some(ExecutionError::Cancelled))
            }
            BackendOutcome::Failed(message) => (
                TaskStatus::Failed,
                Some(ExecutionError::ExecutionFailed(message)),
            ),
            BackendOutcome::Cancelled => (TaskStatus::Cancelled, Some(ExecutionError::Cancelled)),
        }
    }
}

/// Pulls scenarios in queue order and admits each once its resources are granted.
async fn dispatch(shared: Arc<Shared>) {
    while let Some(mut task) = shared.queue.dequeue_next().await {
        let token = shared.state().token(&task.id);
        if token.is_cancelled() {
            shared.finish(ExecutionResult::cancelled(&task));
            continue;
        }

        shared.state().admitting = Some(task.id.clone());
        let grant = tokio::select! {
            biased;
            () = token.cancelled() => None,
            grant = shared.resources.acquire(task.requirement) => Some(grant),
        };
        shared.state().admitting = None;

        match grant {
            None => shared.finish(ExecutionResult::cancelled(&task)),
            Some(Err(err)) => {
                warn!(scenario = %task.id, error = %err, "Scenario rejected");
                shared.finish(ExecutionResult {
                    scenario_id: task.id.clone(),
                    status: TaskStatus::Failed,
                    attempts: task.attempt.saturating_sub(1),
                    duration: Duration::ZERO,
                    spans: Vec::new(),
                    error: Some(err),
                });
            }
            Some(Ok(guard)) => {
                task.status = TaskStatus::Running;
                shared.set_status(&task.id, TaskStatus::Running);
                tokio::spawn(run_attempt(Arc::clone(&shared), task, guard, token));
            }
        }
    }
    debug!("Dispatcher stopped");
}

/// Runs one attempt while holding `guard`, then retries or reports.
async fn run_attempt(
    shared: Arc<Shared>,
    mut task: ScenarioTask,
    guard: ResourceGuard,
    token: CancellationToken,
) {
    let started = Instant::now();
    let collector = SpanCollector::new(task.id.clone());
    let launch = Launch {
        scenario: task.id.clone(),
        attempt: task.attempt,
        descriptor: task.descriptor.clone(),
        recorder: collector.recorder(),
        token: token.clone(),
    };
    let timeout = task
        .timeout
        .unwrap_or_else(|| shared.config.default_timeout());
    debug!(
        scenario = %task.id,
        attempt = task.attempt,
        resources = %guard.granted(),
        "Starting scenario"
    );

    let deadline = started + timeout;
    let (status, error) = match shared.launch(launch, &token, deadline, timeout).await {
        Ok(mut handle) => {
            shared
                .supervise(&mut handle, &token, deadline, timeout)
                .await
        }
        Err(outcome) => outcome,
    };
    let spans = collector.freeze();
    drop(guard);
    let duration = started.elapsed();

    let decision = match &error {
        Some(err) if err.is_retryable() => shared.config.retry.decide(status, task.attempt),
        _ => RetryDecision::Finish,
    };
    if let RetryDecision::Retry {
        next_attempt,
        delay,
    } = decision
    {
        warn!(
            scenario = %task.id,
            attempt = task.attempt,
            next_attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = ?error,
            "Scenario failed, retrying"
        );
        task.attempt = next_attempt;
        task.status = TaskStatus::Queued;
        shared.set_status(&task.id, TaskStatus::Queued);
        requeue(&shared, task, &token, delay).await;
        return;
    }

    shared.finish(ExecutionResult {
        scenario_id: task.id,
        status,
        attempts: task.attempt,
        duration,
        spans,
        error,
    });
}

async fn requeue(shared: &Shared, task: ScenarioTask, token: &CancellationToken, delay: Duration) {
    if !delay.is_zero() {
        tokio::select! {
            () = token.cancelled() => {
                shared.finish(ExecutionResult::cancelled(&task));
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }

    let fallback = ExecutionResult::cancelled(&task);
    if shared.queue.enqueue(task).is_err() {
        warn!(scenario = %fallback.scenario_id, "Queue closed before retry");
        shared.finish(fallback);
    }
}
