//! # regress-proto
//!
//! Shared types for the Regress scenario executor.
//!
//! These types cross the boundary between the engine in `regress-core`, the
//! execution backends that report spans, and any external tool that formats
//! results or stores baselines. Everything here is plain data and serializes
//! with `serde`.

mod scenario;
mod span;

pub use scenario::{Priority, ResourceRequirement, ScenarioId, TaskStatus};
pub use span::{Span, SpanId, SpanStatus};
