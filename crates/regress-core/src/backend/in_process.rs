//! In-process backend: scenarios are async functions registered by name.

use super::{BackendOutcome, ExecutionBackend, ExecutionHandle, Launch};
use crate::cancel::CancellationToken;
use crate::collector::SpanRecorder;
use crate::error::ExecutionError;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use regress_proto::ScenarioId;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// What a registered scenario function receives.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    pub scenario: ScenarioId,
    pub attempt: u32,
    pub params: serde_json::Value,
    pub recorder: SpanRecorder,
    pub token: CancellationToken,
}

impl ScenarioContext {
    /// Safe point: returns an error once the scenario has been cancelled.
    pub fn checkpoint(&self) -> Result<(), String> {
        if self.token.is_cancelled() {
            Err("cancelled".to_string())
        } else {
            Ok(())
        }
    }
}

type ScenarioFn = Arc<dyn Fn(ScenarioContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Descriptor accepted by [`InProcessBackend`]: `"name"` or
/// `{"entry": "name", "params": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntryDescriptor {
    Name(String),
    Entry {
        entry: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// Runs registered async functions on the current runtime.
#[derive(Default)]
pub struct InProcessBackend {
    scenarios: HashMap<String, ScenarioFn>,
}

impl std::fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.scenarios.keys().collect();
        names.sort();
        f.debug_struct("InProcessBackend")
            .field("scenarios", &names)
            .finish()
    }
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `run` under `entry`, replacing any previous registration.
    #[must_use]
    pub fn register<F, Fut>(mut self, entry: impl Into<String>, run: F) -> Self
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let run: ScenarioFn = Arc::new(move |ctx| run(ctx).boxed());
        self.scenarios.insert(entry.into(), run);
        self
    }

    pub fn has_entry(&self, entry: &str) -> bool {
        self.scenarios.contains_key(entry)
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn start(&self, launch: Launch) -> Result<ExecutionHandle, ExecutionError> {
        let descriptor = EntryDescriptor::deserialize(&launch.descriptor).map_err(|e| {
            ExecutionError::ExecutionFailed(format!("invalid in-process descriptor: {e}"))
        })?;
        let (entry, params) = match descriptor {
            EntryDescriptor::Name(entry) => (entry, serde_json::Value::Null),
            EntryDescriptor::Entry { entry, params } => (entry, params),
        };
        let run = self.scenarios.get(&entry).cloned().ok_or_else(|| {
            ExecutionError::ExecutionFailed(format!("no scenario registered as '{entry}'"))
        })?;

        debug!(scenario = %launch.scenario, entry = %entry, attempt = launch.attempt, "Starting in-process scenario");
        let ctx = ScenarioContext {
            scenario: launch.scenario.clone(),
            attempt: launch.attempt,
            params,
            recorder: launch.recorder,
            token: launch.token,
        };
        Ok(ExecutionHandle::spawn(launch.scenario, async move {
            match run(ctx).await {
                Ok(()) => BackendOutcome::Succeeded,
                Err(message) => BackendOutcome::Failed(message),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SpanCollector;
    use serde_json::json;

    fn launch(descriptor: serde_json::Value, collector: &SpanCollector) -> Launch {
        Launch {
            scenario: ScenarioId::new("s"),
            attempt: 1,
            descriptor,
            recorder: collector.recorder(),
            token: CancellationToken::new(),
        }
    }

    fn backend() -> InProcessBackend {
        InProcessBackend::new()
            .register("greet", |ctx: ScenarioContext| async move {
                let mut span = ctx.recorder.start_span("greet", None);
                span.set_attribute("who", ctx.params["who"].clone());
                span.finish();
                Ok(())
            })
            .register("fail", |_ctx| async { Err("nope".to_string()) })
    }

    #[tokio::test]
    async fn test_runs_registered_entry_with_params() {
        let collector = SpanCollector::new(ScenarioId::new("s"));
        let backend = backend();

        let mut handle = backend
            .start(launch(json!({"entry": "greet", "params": {"who": "ada"}}), &collector))
            .await
            .unwrap();
        assert_eq!(backend.wait(&mut handle).await, BackendOutcome::Succeeded);

        let spans = collector.freeze();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].attributes["who"], "ada");
    }

    #[tokio::test]
    async fn test_bare_name_descriptor() {
        let collector = SpanCollector::new(ScenarioId::new("s"));
        let backend = backend();
        let mut handle = backend.start(launch(json!("fail"), &collector)).await.unwrap();
        assert_eq!(
            backend.wait(&mut handle).await,
            BackendOutcome::Failed("nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_entry_fails_to_start() {
        let collector = SpanCollector::new(ScenarioId::new("s"));
        let err = backend()
            .start(launch(json!({"entry": "missing"}), &collector))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionFailed(msg) if msg.contains("missing")));
    }

    #[test]
    fn test_checkpoint_reports_cancellation() {
        let collector = SpanCollector::new(ScenarioId::new("s"));
        let ctx = ScenarioContext {
            scenario: ScenarioId::new("s"),
            attempt: 1,
            params: json!(null),
            recorder: collector.recorder(),
            token: CancellationToken::new(),
        };
        assert!(ctx.checkpoint().is_ok());
        ctx.token.cancel();
        assert!(ctx.checkpoint().is_err());
    }
}
