//! Trace comparison.
//!
//! Span ids differ between runs, so spans are matched by their ancestor name
//! path plus their own name. When siblings share a name, the Nth occurrence in
//! the baseline is paired with the Nth occurrence in the current trace.
//!
//! Both trees are walked breadth-first from the virtual root with siblings in
//! alphabetical order. Full comparison and early exit share that walk, so the
//! first item found by [`find_first_failure`] is always the first item of
//! [`compare`].

use crate::tree::{NodeId, SpanTree};
use regex::Regex;
use regress_proto::{Span, SpanStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

/// Allowed drift between baseline and current span durations.
///
/// Written as a one-key map in config and JSON: `{relative: 0.2}` or
/// `{absolute_ms: 50}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ToleranceFields", into = "ToleranceFields")]
pub enum DurationTolerance {
    /// Maximum absolute difference in milliseconds.
    AbsoluteMs(u64),
    /// Maximum difference as a fraction of the baseline duration (0.2 = ±20%).
    Relative(f64),
}

impl DurationTolerance {
    pub fn accepts(&self, before: Duration, after: Duration) -> bool {
        let delta = before.abs_diff(after);
        match *self {
            DurationTolerance::AbsoluteMs(ms) => delta <= Duration::from_millis(ms),
            DurationTolerance::Relative(fraction) => {
                delta.as_secs_f64() <= before.as_secs_f64() * fraction.abs()
            }
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToleranceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relative: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    absolute_ms: Option<u64>,
}

impl TryFrom<ToleranceFields> for DurationTolerance {
    type Error = String;

    fn try_from(fields: ToleranceFields) -> Result<Self, Self::Error> {
        match (fields.relative, fields.absolute_ms) {
            (Some(fraction), None) => Ok(DurationTolerance::Relative(fraction)),
            (None, Some(ms)) => Ok(DurationTolerance::AbsoluteMs(ms)),
            (Some(_), Some(_)) => {
                Err("tolerance takes either `relative` or `absolute_ms`, not both".to_string())
            }
            (None, None) => Err("tolerance needs `relative` or `absolute_ms`".to_string()),
        }
    }
}

impl From<DurationTolerance> for ToleranceFields {
    fn from(tolerance: DurationTolerance) -> Self {
        match tolerance {
            DurationTolerance::Relative(fraction) => Self {
                relative: Some(fraction),
                ..Self::default()
            },
            DurationTolerance::AbsoluteMs(ms) => Self {
                absolute_ms: Some(ms),
                ..Self::default()
            },
        }
    }
}

/// Comparison settings.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// `None` disables duration comparison.
    pub duration_tolerance: Option<DurationTolerance>,
    /// Attribute keys matching any of these are not compared.
    pub ignore_attributes: Vec<Regex>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            duration_tolerance: Some(DurationTolerance::Relative(0.2)),
            ignore_attributes: Vec::new(),
        }
    }
}

impl DiffOptions {
    pub fn with_tolerance(mut self, tolerance: Option<DurationTolerance>) -> Self {
        self.duration_tolerance = tolerance;
        self
    }

    pub fn ignore_attribute(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.ignore_attributes.push(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn ignores(&self, attribute: &str) -> bool {
        self.ignore_attributes.iter().any(|re| re.is_match(attribute))
    }
}

/// Stable identity of a span across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanKey {
    /// Names of the ancestors, outermost first.
    pub path: Vec<String>,
    pub name: String,
    /// 0-based index among same-named siblings.
    pub occurrence: usize,
}

impl fmt::Display for SpanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.path {
            write!(f, "{segment}/")?;
        }
        f.write_str(&self.name)?;
        if self.occurrence > 0 {
            write!(f, "[{}]", self.occurrence)?;
        }
        Ok(())
    }
}

/// One difference between baseline and current trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffItem {
    MissingSpan {
        key: SpanKey,
    },
    ExtraSpan {
        key: SpanKey,
    },
    AttributeChanged {
        key: SpanKey,
        attribute: String,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    },
    StatusChanged {
        key: SpanKey,
        before: SpanStatus,
        after: SpanStatus,
    },
    DurationChanged {
        key: SpanKey,
        before: Duration,
        after: Duration,
    },
}

impl DiffItem {
    pub fn key(&self) -> &SpanKey {
        match self {
            DiffItem::MissingSpan { key }
            | DiffItem::ExtraSpan { key }
            | DiffItem::AttributeChanged { key, .. }
            | DiffItem::StatusChanged { key, .. }
            | DiffItem::DurationChanged { key, .. } => key,
        }
    }

    /// Duration drift is reported but never counts as a regression.
    pub fn is_regression(&self) -> bool {
        !matches!(self, DiffItem::DurationChanged { .. })
    }
}

impl fmt::Display for DiffItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffItem::MissingSpan { key } => write!(f, "missing span {key}"),
            DiffItem::ExtraSpan { key } => write!(f, "extra span {key}"),
            DiffItem::AttributeChanged {
                key,
                attribute,
                before,
                after,
            } => write!(
                f,
                "{key}: attribute {attribute} changed from {} to {}",
                show(before.as_ref()),
                show(after.as_ref())
            ),
            DiffItem::StatusChanged { key, before, after } => {
                write!(f, "{key}: status changed from {before} to {after}")
            }
            DiffItem::DurationChanged { key, before, after } => {
                write!(f, "{key}: duration changed from {before:?} to {after:?}")
            }
        }
    }
}

fn show(value: Option<&serde_json::Value>) -> String {
    value.map_or_else(|| "<unset>".to_string(), ToString::to_string)
}

/// Counts per difference kind, plus spans matched on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub matched: usize,
    pub missing: usize,
    pub extra: usize,
    pub attribute_changes: usize,
    pub status_changes: usize,
    pub duration_changes: usize,
}

impl DiffSummary {
    fn count(&mut self, item: &DiffItem) {
        match item {
            DiffItem::MissingSpan { .. } => self.missing += 1,
            DiffItem::ExtraSpan { .. } => self.extra += 1,
            DiffItem::AttributeChanged { .. } => self.attribute_changes += 1,
            DiffItem::StatusChanged { .. } => self.status_changes += 1,
            DiffItem::DurationChanged { .. } => self.duration_changes += 1,
        }
    }
}

/// Full comparison outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffResult {
    pub identical: bool,
    pub differences: Vec<DiffItem>,
    pub first_failure: Option<DiffItem>,
    pub summary: DiffSummary,
}

impl DiffResult {
    /// Share of spans matched by key, from 0.0 to 1.0. Two empty traces score 1.0.
    pub fn similarity(&self) -> f64 {
        let s = &self.summary;
        let total = s.matched + s.missing + s.extra;
        if total == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let score = s.matched as f64 / total as f64;
        score
    }

    /// True if any difference other than duration drift was found.
    pub fn has_regressions(&self) -> bool {
        self.differences.iter().any(DiffItem::is_regression)
    }
}

/// Compares two trees and reports every difference in traversal order.
pub fn compare(baseline: &SpanTree, current: &SpanTree, options: &DiffOptions) -> DiffResult {
    let mut differences = Vec::new();
    let mut summary = DiffSummary::default();
    let _ = walk(baseline, current, options, &mut summary, |item| {
        differences.push(item);
        ControlFlow::<()>::Continue(())
    });

    DiffResult {
        identical: differences.is_empty(),
        first_failure: differences.first().cloned(),
        differences,
        summary,
    }
}

/// Returns the first difference [`compare`] would report, without finishing the walk.
pub fn find_first_failure(
    baseline: &SpanTree,
    current: &SpanTree,
    options: &DiffOptions,
) -> Option<DiffItem> {
    let mut summary = DiffSummary::default();
    match walk(baseline, current, options, &mut summary, ControlFlow::Break) {
        ControlFlow::Break(item) => Some(item),
        ControlFlow::Continue(()) => None,
    }
}

enum Step {
    /// Both sides have this key. `None` nodes are the virtual roots.
    Matched(Option<NodeId>, Option<NodeId>),
    Missing(NodeId),
    Extra(NodeId),
}

struct Pending {
    step: Step,
    key: SpanKey,
}

fn walk<B>(
    baseline: &SpanTree,
    current: &SpanTree,
    options: &DiffOptions,
    summary: &mut DiffSummary,
    mut sink: impl FnMut(DiffItem) -> ControlFlow<B>,
) -> ControlFlow<B> {
    let mut queue = VecDeque::new();
    queue.push_back(Pending {
        step: Step::Matched(None, None),
        key: SpanKey {
            path: Vec::new(),
            name: String::new(),
            occurrence: 0,
        },
    });

    while let Some(Pending { step, key }) = queue.pop_front() {
        match step {
            Step::Matched(b, c) => {
                if let (Some(b), Some(c)) = (b, c) {
                    summary.matched += 1;
                    for item in compare_pair(baseline.span(b), current.span(c), &key, options) {
                        summary.count(&item);
                        sink(item)?;
                    }
                }
                let path = child_path(&key, b.is_none());
                pair_children(
                    baseline.children(b),
                    baseline,
                    current.children(c),
                    current,
                    &path,
                    &mut queue,
                );
            }
            Step::Missing(b) => {
                let path = child_path(&key, false);
                summary.missing += 1;
                sink(DiffItem::MissingSpan { key })?;
                one_sided_children(baseline, b, &path, Step::Missing, &mut queue);
            }
            Step::Extra(c) => {
                let path = child_path(&key, false);
                summary.extra += 1;
                sink(DiffItem::ExtraSpan { key })?;
                one_sided_children(current, c, &path, Step::Extra, &mut queue);
            }
        }
    }
    ControlFlow::Continue(())
}

fn child_path(parent: &SpanKey, parent_is_root: bool) -> Vec<String> {
    if parent_is_root {
        return Vec::new();
    }
    let mut path = parent.path.clone();
    path.push(parent.name.clone());
    path
}

/// Pairs two sorted sibling lists by name and occurrence.
fn pair_children(
    base_children: &[NodeId],
    baseline: &SpanTree,
    cur_children: &[NodeId],
    current: &SpanTree,
    path: &[String],
    queue: &mut VecDeque<Pending>,
) {
    let names: BTreeSet<&str> = base_children
        .iter()
        .map(|n| baseline.span(*n).name.as_str())
        .chain(cur_children.iter().map(|n| current.span(*n).name.as_str()))
        .collect();

    for name in names {
        let base: Vec<NodeId> = same_name(base_children, baseline, name);
        let cur: Vec<NodeId> = same_name(cur_children, current, name);

        for occurrence in 0..base.len().max(cur.len()) {
            let step = match (base.get(occurrence), cur.get(occurrence)) {
                (Some(b), Some(c)) => Step::Matched(Some(*b), Some(*c)),
                (Some(b), None) => Step::Missing(*b),
                (None, Some(c)) => Step::Extra(*c),
                (None, None) => continue,
            };
            queue.push_back(Pending {
                step,
                key: SpanKey {
                    path: path.to_vec(),
                    name: name.to_string(),
                    occurrence,
                },
            });
        }
    }
}

fn same_name(children: &[NodeId], tree: &SpanTree, name: &str) -> Vec<NodeId> {
    children
        .iter()
        .copied()
        .filter(|n| tree.span(*n).name == name)
        .collect()
}

fn one_sided_children(
    tree: &SpanTree,
    parent: NodeId,
    path: &[String],
    step: fn(NodeId) -> Step,
    queue: &mut VecDeque<Pending>,
) {
    let mut previous: Option<&str> = None;
    let mut occurrence = 0;
    for &child in tree.children(Some(parent)) {
        let name = tree.span(child).name.as_str();
        occurrence = if previous == Some(name) { occurrence + 1 } else { 0 };
        previous = Some(name);
        queue.push_back(Pending {
            step: step(child),
            key: SpanKey {
                path: path.to_vec(),
                name: name.to_string(),
                occurrence,
            },
        });
    }
}

/// Attribute changes by key, then status, then duration.
fn compare_pair(before: &Span, after: &Span, key: &SpanKey, options: &DiffOptions) -> Vec<DiffItem> {
    let mut items = Vec::new();

    let attributes: BTreeSet<&String> = before
        .attributes
        .keys()
        .chain(after.attributes.keys())
        .collect();
    for attribute in attributes {
        if options.ignores(attribute) {
            continue;
        }
        let old = before.attributes.get(attribute);
        let new = after.attributes.get(attribute);
        if old != new {
            items.push(DiffItem::AttributeChanged {
                key: key.clone(),
                attribute: attribute.clone(),
                before: old.cloned(),
                after: new.cloned(),
            });
        }
    }

    if before.status != after.status {
        items.push(DiffItem::StatusChanged {
            key: key.clone(),
            before: before.status.clone(),
            after: after.status.clone(),
        });
    }

    if let Some(tolerance) = options.duration_tolerance {
        let (old, new) = (before.duration(), after.duration());
        if !tolerance.accepts(old, new) {
            items.push(DiffItem::DurationChanged {
                key: key.clone(),
                before: old,
                after: new,
            });
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn timed(id: &str, name: &str, ms: i64) -> Span {
        Span::new(id, name, at_ms(0), at_ms(ms))
    }

    fn tree(spans: Vec<Span>) -> SpanTree {
        SpanTree::build(spans).unwrap()
    }

    fn relative(fraction: f64) -> DiffOptions {
        DiffOptions::default().with_tolerance(Some(DurationTolerance::Relative(fraction)))
    }

    #[test]
    fn test_duration_outside_tolerance_is_reported() {
        let baseline = tree(vec![timed("b1", "db_query", 10)]);
        let current = tree(vec![timed("c1", "db_query", 50)]);

        let result = compare(&baseline, &current, &relative(0.2));
        assert!(!result.identical);
        assert_eq!(result.differences.len(), 1);
        assert!(matches!(
            &result.differences[0],
            DiffItem::DurationChanged { before, after, .. }
                if *before == Duration::from_millis(10) && *after == Duration::from_millis(50)
        ));
        assert!(!result.has_regressions());
    }

    #[test]
    fn test_duration_inside_wide_tolerance_is_identical() {
        let baseline = tree(vec![timed("b1", "db_query", 10)]);
        let current = tree(vec![timed("c1", "db_query", 50)]);

        let result = compare(&baseline, &current, &relative(5.0));
        assert!(result.identical);
        assert!(result.differences.is_empty());
        assert!(result.first_failure.is_none());
    }

    #[test]
    fn test_absolute_tolerance_and_disabled_durations() {
        let baseline = tree(vec![timed("b1", "db_query", 10)]);
        let current = tree(vec![timed("c1", "db_query", 30)]);

        let loose = DiffOptions::default().with_tolerance(Some(DurationTolerance::AbsoluteMs(25)));
        assert!(compare(&baseline, &current, &loose).identical);

        let tight = DiffOptions::default().with_tolerance(Some(DurationTolerance::AbsoluteMs(5)));
        assert!(!compare(&baseline, &current, &tight).identical);

        let off = DiffOptions::default().with_tolerance(None);
        assert!(compare(&baseline, &current, &off).identical);
    }

    #[test]
    fn test_missing_span_found_by_both_modes() {
        let baseline = tree(vec![
            timed("r", "request", 10),
            timed("a", "auth_check", 2),
        ]);
        let current = tree(vec![timed("r2", "request", 10)]);
        let options = DiffOptions::default();

        let result = compare(&baseline, &current, &options);
        let expected = DiffItem::MissingSpan {
            key: SpanKey {
                path: Vec::new(),
                name: "auth_check".to_string(),
                occurrence: 0,
            },
        };
        assert_eq!(result.differences, vec![expected.clone()]);
        assert_eq!(result.first_failure, Some(expected.clone()));
        assert_eq!(
            find_first_failure(&baseline, &current, &options),
            Some(expected)
        );
        assert!(result.has_regressions());
    }

    #[test]
    fn test_missing_subtree_reports_descendants() {
        let baseline = tree(vec![
            timed("r", "request", 10),
            timed("a", "auth", 5).with_parent("r"),
            timed("t", "token_lookup", 1).with_parent("a"),
        ]);
        let current = tree(vec![timed("r", "request", 10)]);

        let result = compare(&baseline, &current, &DiffOptions::default());
        let keys: Vec<String> = result.differences.iter().map(|d| d.key().to_string()).collect();
        assert_eq!(keys, vec!["request/auth", "request/auth/token_lookup"]);
        assert_eq!(result.summary.missing, 2);
        assert_eq!(result.summary.matched, 1);
    }

    #[test]
    fn test_repeated_names_pair_by_occurrence() {
        let baseline = tree(vec![
            Span::new("b1", "retry", at_ms(0), at_ms(10)),
            Span::new("b2", "retry", at_ms(20), at_ms(30)),
        ]);
        let current = tree(vec![
            Span::new("c1", "retry", at_ms(0), at_ms(10)),
            Span::new("c2", "retry", at_ms(20), at_ms(30)),
            Span::new("c3", "retry", at_ms(40), at_ms(50)),
        ]);

        let result = compare(&baseline, &current, &DiffOptions::default());
        assert_eq!(
            result.differences,
            vec![DiffItem::ExtraSpan {
                key: SpanKey {
                    path: Vec::new(),
                    name: "retry".to_string(),
                    occurrence: 2,
                }
            }]
        );
        assert_eq!(result.summary.matched, 2);
        assert!((result.similarity() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_attribute_and_status_changes_in_order() {
        let baseline = tree(vec![
            timed("b", "login", 10)
                .with_attribute("user", "alice")
                .with_attribute("attempts", 1),
        ]);
        let current = tree(vec![
            timed("c", "login", 10)
                .with_attribute("user", "bob")
                .with_attribute("region", "eu")
                .with_status(SpanStatus::error("denied")),
        ]);

        let result = compare(&baseline, &current, &DiffOptions::default());
        let kinds: Vec<String> = result
            .differences
            .iter()
            .map(|d| match d {
                DiffItem::AttributeChanged { attribute, .. } => format!("attr:{attribute}"),
                DiffItem::StatusChanged { .. } => "status".to_string(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec!["attr:attempts", "attr:region", "attr:user", "status"]);
        assert_eq!(result.summary.attribute_changes, 3);
        assert_eq!(result.summary.status_changes, 1);
    }

    #[test]
    fn test_ignored_attributes_are_skipped() {
        let baseline = tree(vec![timed("b", "spawn", 10).with_attribute("process.pid", 101)]);
        let current = tree(vec![timed("c", "spawn", 10).with_attribute("process.pid", 202)]);

        let options = DiffOptions::default()
            .ignore_attribute(r"^process\.pid$")
            .unwrap();
        assert!(compare(&baseline, &current, &options).identical);
    }

    #[test]
    fn test_breadth_first_across_levels() {
        // A shallow extra span is reported before a deeper missing one.
        let baseline = tree(vec![
            timed("r", "request", 10),
            timed("d", "deep", 1).with_parent("r"),
        ]);
        let current = tree(vec![timed("r", "request", 10), timed("x", "zeta", 1)]);

        let result = compare(&baseline, &current, &DiffOptions::default());
        let rendered: Vec<String> = result.differences.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["extra span zeta", "missing span request/deep"]
        );
        assert_eq!(
            find_first_failure(&baseline, &current, &DiffOptions::default()),
            result.first_failure
        );
    }

    #[test]
    fn test_empty_trees_are_identical() {
        let empty = SpanTree::default();
        let result = compare(&empty, &empty, &DiffOptions::default());
        assert!(result.identical);
        assert!((result.similarity() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_relative_tolerance_with_zero_baseline() {
        let tolerance = DurationTolerance::Relative(0.2);
        assert!(tolerance.accepts(Duration::ZERO, Duration::ZERO));
        assert!(!tolerance.accepts(Duration::ZERO, Duration::from_millis(1)));
    }

    #[test]
    fn test_tolerance_is_a_single_key_map() {
        let relative: DurationTolerance = serde_json::from_str(r#"{"relative": 0.2}"#).unwrap();
        assert_eq!(relative, DurationTolerance::Relative(0.2));
        assert_eq!(
            serde_json::to_value(DurationTolerance::AbsoluteMs(50)).unwrap(),
            serde_json::json!({"absolute_ms": 50})
        );

        assert!(serde_json::from_str::<DurationTolerance>(r#"{"relative": 0.2, "absolute_ms": 5}"#).is_err());
        assert!(serde_json::from_str::<DurationTolerance>("{}").is_err());
        assert!(serde_json::from_str::<DurationTolerance>(r#"{"percent": 20}"#).is_err());
    }
}
