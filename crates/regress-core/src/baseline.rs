//! Baseline loading and capture.
//!
//! A baseline file is a JSON record with the scenario id, the capture time and
//! a flat list of spans:
//!
//! ```json
//! {
//!   "scenario": "login-flow",
//!   "captured_at": "2026-01-01T00:00:00Z",
//!   "spans": [
//!     {"id": "s1", "name": "request",
//!      "start_time": "2026-01-01T00:00:00Z", "end_time": "2026-01-01T00:00:00.010Z",
//!      "status": {"code": "ok"}, "attributes": {"http.method": "GET"}}
//!   ]
//! }
//! ```
//!
//! Where baselines live is up to the caller.

use crate::diff::{DiffItem, DiffOptions, DiffResult, compare, find_first_failure};
use crate::error::TraceError;
use crate::executor::ExecutionResult;
use crate::tree::SpanTree;
use chrono::{DateTime, Utc};
use regress_proto::{ScenarioId, Span};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct BaselineFile {
    scenario: ScenarioId,
    captured_at: DateTime<Utc>,
    spans: Vec<Span>,
}

/// A reference trace for one scenario.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub scenario: ScenarioId,
    pub captured_at: DateTime<Utc>,
    pub tree: SpanTree,
}

impl Baseline {
    /// Parses baseline JSON. Empty or unparseable input is `MalformedBaseline`.
    pub fn parse(json: &str) -> Result<Self, TraceError> {
        if json.trim().is_empty() {
            return Err(TraceError::MalformedBaseline("baseline is empty".to_string()));
        }
        let file: BaselineFile =
            serde_json::from_str(json).map_err(|e| TraceError::MalformedBaseline(e.to_string()))?;
        Ok(Self {
            scenario: file.scenario,
            captured_at: file.captured_at,
            tree: SpanTree::build(file.spans)?,
        })
    }

    /// Reads and parses a baseline file. A missing file is `MalformedBaseline`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            let reason = if e.kind() == ErrorKind::NotFound {
                format!("baseline not found: {}", path.display())
            } else {
                format!("cannot read {}: {e}", path.display())
            };
            TraceError::MalformedBaseline(reason)
        })?;
        let baseline = Self::parse(&json)?;
        debug!(
            path = %path.display(),
            scenario = %baseline.scenario,
            spans = baseline.tree.len(),
            "Loaded baseline"
        );
        Ok(baseline)
    }

    /// Captures the spans of a finished execution as a new baseline.
    pub fn capture(result: &ExecutionResult) -> Result<Self, TraceError> {
        Ok(Self {
            scenario: result.scenario_id.clone(),
            captured_at: Utc::now(),
            tree: SpanTree::build(result.spans.clone())?,
        })
    }

    /// Serializes to the file format, spans in breadth-first order.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&BaselineFile {
            scenario: self.scenario.clone(),
            captured_at: self.captured_at,
            spans: self.tree.flatten(),
        })
    }

    /// Writes the baseline, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = self.to_json().map_err(std::io::Error::other)?;
        fs::write(path, json)?;
        debug!(path = %path.display(), scenario = %self.scenario, "Saved baseline");
        Ok(())
    }

    /// Full comparison of `result` against this baseline.
    pub fn diff(&self, result: &ExecutionResult, options: &DiffOptions) -> Result<DiffResult, TraceError> {
        let current = SpanTree::build(result.spans.clone())?;
        Ok(compare(&self.tree, &current, options))
    }

    /// First difference of `result` against this baseline, if any.
    pub fn first_failure(
        &self,
        result: &ExecutionResult,
        options: &DiffOptions,
    ) -> Result<Option<DiffItem>, TraceError> {
        let current = SpanTree::build(result.spans.clone())?;
        Ok(find_first_failure(&self.tree, &current, options))
    }
}
