//! Timed units of work captured while a scenario runs.
//!
//! A span carries an explicit parent reference instead of being nested, so
//! spans can be recorded in any completion order and reassembled later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Identifier of a span, unique within one scenario execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(String);

impl SpanId {
    /// Creates a span id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpanId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SpanId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Outcome recorded on a span.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Ok,
    Error {
        message: String,
    },
}

impl SpanStatus {
    /// Creates an error status with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns true for the error variant.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

/// A named, timed unit of work with an optional parent.
///
/// Attribute keys are unique and kept sorted, so two spans with the same
/// attributes compare equal regardless of the order they were set in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Span {
    /// Creates a root-level span with `Ok` status and no attributes.
    pub fn new(
        id: impl Into<SpanId>,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: name.into(),
            start_time,
            end_time,
            status: SpanStatus::Ok,
            attributes: BTreeMap::new(),
        }
    }

    /// Sets the parent span id.
    pub fn with_parent(mut self, parent: impl Into<SpanId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    /// Sets an attribute, replacing any previous value for the key.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Sets the span status.
    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    /// Wall-clock length of the span. An end before the start counts as zero.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns true if the span has no parent reference.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
