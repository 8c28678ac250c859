//! Harness configuration.
//!
//! Loaded from YAML; every field has a default so a partial file (or no file
//! at all) is valid. The harness only reads configuration, it never writes it.

use crate::diff::{DiffOptions, DurationTolerance};
use crate::error::ConfigError;
use crate::executor::RetryPolicy;
use crate::resources::ResourceBudget;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub executor: ExecutorConfig,
    pub diff: DiffConfig,
}

impl HarnessConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded harness config");
        Self::from_yaml_str(&content)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Total resources shared by all running scenarios.
    pub budget: ResourceBudget,

    /// Hard timeout for scenarios that do not set their own.
    pub default_timeout_secs: u64,

    /// How long a timed-out scenario gets to honor its cancellation token
    /// before it is forcibly terminated.
    pub cancel_grace_ms: u64,

    /// Cancel all remaining work after the first failed or timed-out scenario.
    pub fail_fast: bool,

    /// Promote a waiting scenario one tier per interval. Disabled when unset.
    pub aging_secs: Option<u64>,

    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            budget: ResourceBudget::default(),
            default_timeout_secs: 300,
            cancel_grace_ms: 500,
            fail_fast: false,
            aging_secs: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn aging(&self) -> Option<Duration> {
        self.aging_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Trace comparison settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Allowed duration drift. `None` skips duration comparison entirely.
    pub tolerance: Option<DurationTolerance>,

    /// Regex patterns; matching attribute keys are not compared.
    pub ignore_attributes: Vec<String>,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            tolerance: Some(DurationTolerance::Relative(0.2)),
            ignore_attributes: Vec::new(),
        }
    }
}

impl DiffConfig {
    /// Compiles the ignore patterns into comparison options.
    pub fn options(&self) -> Result<DiffOptions, ConfigError> {
        let ignored = self
            .ignore_attributes
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DiffOptions {
            duration_tolerance: self.tolerance,
            ignore_attributes: ignored,
        })
    }
}
