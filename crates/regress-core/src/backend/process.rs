//! Isolated-process backend.
//!
//! Each attempt runs as a child process. Stdout is scanned line by line; lines
//! holding a JSON span object are recorded, anything else is ordinary output.
//! The child is killed if the attempt is aborted or its token is cancelled.

use super::{BackendOutcome, ExecutionBackend, ExecutionHandle, Launch};
use crate::cancel::CancellationToken;
use crate::collector::SpanRecorder;
use crate::error::ExecutionError;
use async_trait::async_trait;
use regress_proto::{ScenarioId, Span};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// Descriptor accepted by [`ProcessBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// Runs scenarios as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    /// Environment added to every child before the per-scenario `env`.
    base_env: BTreeMap<String, String>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn start(&self, launch: Launch) -> Result<ExecutionHandle, ExecutionError> {
        let spec = CommandSpec::deserialize(&launch.descriptor).map_err(|e| {
            ExecutionError::ExecutionFailed(format!("invalid process descriptor: {e}"))
        })?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&self.base_env)
            .envs(&spec.env)
            .env("REGRESS_SCENARIO", launch.scenario.as_str())
            .env("REGRESS_ATTEMPT", launch.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            ExecutionError::ExecutionFailed(format!("failed to spawn {}: {e}", spec.program))
        })?;
        debug!(
            scenario = %launch.scenario,
            program = %spec.program,
            pid = child.id(),
            attempt = launch.attempt,
            "Spawned scenario process"
        );

        let stdout = child.stdout.take();
        let scenario = launch.scenario.clone();
        Ok(ExecutionHandle::spawn(
            launch.scenario,
            supervise(scenario, child, stdout, launch.recorder, launch.token),
        ))
    }
}

async fn supervise(
    scenario: ScenarioId,
    mut child: Child,
    stdout: Option<ChildStdout>,
    recorder: SpanRecorder,
    token: CancellationToken,
) -> BackendOutcome {
    let reader = async {
        if let Some(stdout) = stdout {
            pump_spans(&scenario, stdout, &recorder).await;
        }
    };
    let exit = async {
        tokio::select! {
            status = child.wait() => status.map(Some),
            () = token.cancelled() => {
                if let Err(err) = child.start_kill() {
                    warn!(scenario = %scenario, error = %err, "Failed to kill cancelled process");
                }
                child.wait().await.map(|_| None)
            }
        }
    };

    let ((), exit) = tokio::join!(reader, exit);
    match exit {
        Ok(Some(status)) => outcome_for(status),
        Ok(None) => BackendOutcome::Cancelled,
        Err(err) => BackendOutcome::Failed(format!("failed to wait for process: {err}")),
    }
}

fn outcome_for(status: ExitStatus) -> BackendOutcome {
    if status.success() {
        BackendOutcome::Succeeded
    } else {
        match status.code() {
            Some(code) => BackendOutcome::Failed(format!("process exited with status {code}")),
            None => BackendOutcome::Failed("process terminated by signal".to_string()),
        }
    }
}

async fn pump_spans(scenario: &ScenarioId, stdout: ChildStdout, recorder: &SpanRecorder) {
    let mut lines = BufReader::new(stdout).lines();
    let mut line_no = 0usize;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                line_no += 1;
                if let Some(span) = parse_span_line(scenario, line_no, &line) {
                    recorder.record_span(span);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(scenario = %scenario, error = %err, "Stopped reading process output");
                break;
            }
        }
    }
}

/// Parses one line of process output as a span.
///
/// Lines that are not JSON objects with `id`, `name` and `start_time` are
/// ordinary output and yield `None` quietly. Span-like objects that fail to
/// parse are logged and skipped.
pub fn parse_span_line(scenario: &ScenarioId, line_no: usize, line: &str) -> Option<Span> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let span_like = ["id", "name", "start_time"]
        .iter()
        .all(|field| value.get(field).is_some());
    if !span_like {
        return None;
    }

    match serde_json::from_value(value) {
        Ok(span) => Some(span),
        Err(err) => {
            warn!(
                scenario = %scenario,
                line = line_no,
                error = %err,
                "Failed to parse span-like output line"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SpanCollector;
    use serde_json::json;

    fn scenario() -> ScenarioId {
        ScenarioId::new("proc")
    }

    #[test]
    fn test_parse_span_line_filters_output() {
        let span = parse_span_line(
            &scenario(),
            1,
            r#"{"id":"a","name":"boot","start_time":"2026-01-01T00:00:00Z","end_time":"2026-01-01T00:00:01Z"}"#,
        )
        .unwrap();
        assert_eq!(span.name, "boot");

        assert!(parse_span_line(&scenario(), 2, "Starting test...").is_none());
        assert!(parse_span_line(&scenario(), 3, r#"{"level":"info"}"#).is_none());
        // Span-like but missing end_time.
        assert!(
            parse_span_line(
                &scenario(),
                4,
                r#"{"id":"b","name":"x","start_time":"2026-01-01T00:00:00Z"}"#
            )
            .is_none()
        );
    }

    #[test]
    fn test_command_spec_defaults() {
        let spec: CommandSpec = serde_json::from_value(json!({"program": "true"})).unwrap();
        assert!(spec.args.is_empty());
        assert!(spec.env.is_empty());
        assert!(spec.workdir.is_none());
    }

    #[cfg(unix)]
    fn launch(descriptor: serde_json::Value, collector: &SpanCollector) -> Launch {
        Launch {
            scenario: scenario(),
            attempt: 1,
            descriptor,
            recorder: collector.recorder(),
            token: CancellationToken::new(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_records_spans_from_stdout() {
        let collector = SpanCollector::new(scenario());
        let script = r#"echo "setting up"
echo '{"id":"1","name":"request","start_time":"2026-01-01T00:00:00Z","end_time":"2026-01-01T00:00:00.010Z"}'
echo '{"id":"2","parent_id":"1","name":"db_query","start_time":"2026-01-01T00:00:00Z","end_time":"2026-01-01T00:00:00.005Z"}'"#;
        let backend = ProcessBackend::new();
        let mut handle = backend
            .start(launch(json!({"program": "sh", "args": ["-c", script]}), &collector))
            .await
            .unwrap();

        assert_eq!(backend.wait(&mut handle).await, BackendOutcome::Succeeded);
        let spans = collector.freeze();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().any(|s| s.name == "db_query"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let collector = SpanCollector::new(scenario());
        let backend = ProcessBackend::new();
        let mut handle = backend
            .start(launch(json!({"program": "sh", "args": ["-c", "exit 3"]}), &collector))
            .await
            .unwrap();
        assert_eq!(
            backend.wait(&mut handle).await,
            BackendOutcome::Failed("process exited with status 3".to_string())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let collector = SpanCollector::new(scenario());
        let backend = ProcessBackend::new();
        let launch = launch(json!({"program": "sleep", "args": ["30"]}), &collector);
        let token = launch.token.clone();
        let mut handle = backend.start(launch).await.unwrap();

        token.cancel();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), backend.wait(&mut handle))
            .await
            .expect("cancelled process should exit promptly");
        assert_eq!(outcome, BackendOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let collector = SpanCollector::new(scenario());
        let launch = Launch {
            scenario: scenario(),
            attempt: 1,
            descriptor: json!({"program": "/definitely/not/a/program"}),
            recorder: collector.recorder(),
            token: CancellationToken::new(),
        };
        let err = ProcessBackend::new().start(launch).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionFailed(_)));
    }
}
