//! Span tree builder.
//!
//! Spans live in a flat arena and refer to each other by index. Spans without
//! a parent, or whose parent is not part of the same trace, hang off a virtual
//! root. Siblings are kept sorted by name (then start, end, id) so traversal
//! order never depends on the order spans were recorded in.

use crate::error::StructuralError;
use regress_proto::{Span, SpanId};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

/// Index of a span inside a [`SpanTree`].
pub type NodeId = usize;

/// Hierarchical view of one scenario's spans.
#[derive(Debug, Clone, Default)]
pub struct SpanTree {
    nodes: Vec<Span>,
    children: Vec<Vec<NodeId>>,
    roots: Vec<NodeId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnPath,
    Done,
}

impl SpanTree {
    /// Builds a tree from spans given in any order.
    ///
    /// Fails on duplicate span ids and on parent cycles (including a span that
    /// names itself as parent). Orphans are attached to the virtual root.
    pub fn build(spans: Vec<Span>) -> Result<Self, StructuralError> {
        let mut index: HashMap<&SpanId, NodeId> = HashMap::with_capacity(spans.len());
        for (i, span) in spans.iter().enumerate() {
            if index.insert(&span.id, i).is_some() {
                return Err(StructuralError::DuplicateSpan {
                    span_id: span.id.clone(),
                });
            }
        }

        let parents: Vec<Option<NodeId>> = spans
            .iter()
            .map(|span| span.parent_id.as_ref().and_then(|p| index.get(p).copied()))
            .collect();
        drop(index);

        check_acyclic(&spans, &parents)?;

        let mut children = vec![Vec::new(); spans.len()];
        let mut roots = Vec::new();
        for (i, parent) in parents.iter().enumerate() {
            match parent {
                Some(p) => children[*p].push(i),
                None => roots.push(i),
            }
        }

        let order = |a: &NodeId, b: &NodeId| sibling_order(&spans[*a], &spans[*b]);
        roots.sort_by(order);
        for list in &mut children {
            list.sort_by(order);
        }

        Ok(Self {
            nodes: spans,
            children,
            roots,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn span(&self, node: NodeId) -> &Span {
        &self.nodes[node]
    }

    /// Children of the virtual root, in sibling order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Children of `parent`, or of the virtual root when `parent` is `None`.
    pub fn children(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            Some(node) => &self.children[node],
            None => &self.roots,
        }
    }

    /// Nodes in breadth-first order from the virtual root.
    pub fn breadth_first(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut queue: VecDeque<NodeId> = self.roots.iter().copied().collect();
        std::iter::from_fn(move || {
            let node = queue.pop_front()?;
            queue.extend(self.children[node].iter().copied());
            Some(node)
        })
    }

    /// All spans in breadth-first order.
    pub fn flatten(&self) -> Vec<Span> {
        self.breadth_first().map(|n| self.nodes[n].clone()).collect()
    }

    /// Consumes the tree and returns the spans in their original order.
    pub fn into_spans(self) -> Vec<Span> {
        self.nodes
    }
}

fn sibling_order(a: &Span, b: &Span) -> Ordering {
    a.name
        .cmp(&b.name)
        .then(a.start_time.cmp(&b.start_time))
        .then(a.end_time.cmp(&b.end_time))
        .then_with(|| a.id.cmp(&b.id))
}

/// Walks every parent chain once. Nodes are visited in id order so the span
/// named in a cycle error does not depend on input order.
fn check_acyclic(spans: &[Span], parents: &[Option<NodeId>]) -> Result<(), StructuralError> {
    let mut state = vec![Visit::New; spans.len()];
    let mut by_id: Vec<NodeId> = (0..spans.len()).collect();
    by_id.sort_by(|a, b| spans[*a].id.cmp(&spans[*b].id));

    let mut path = Vec::new();
    for start in by_id {
        let mut cursor = Some(start);
        while let Some(node) = cursor {
            match state[node] {
                Visit::Done => break,
                Visit::OnPath => {
                    return Err(StructuralError::Cycle {
                        span_id: spans[node].id.clone(),
                    });
                }
                Visit::New => {
                    state[node] = Visit::OnPath;
                    path.push(node);
                    cursor = parents[node];
                }
            }
        }
        for node in path.drain(..) {
            state[node] = Visit::Done;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn span(id: &str, name: &str, parent: Option<&str>) -> Span {
        let span = Span::new(id, name, at_ms(0), at_ms(10));
        match parent {
            Some(p) => span.with_parent(p),
            None => span,
        }
    }

    fn names(tree: &SpanTree, nodes: &[NodeId]) -> Vec<String> {
        nodes.iter().map(|n| tree.span(*n).name.clone()).collect()
    }

    #[test]
    fn test_builds_hierarchy_with_sorted_siblings() {
        let tree = SpanTree::build(vec![
            span("3", "render", Some("1")),
            span("1", "request", None),
            span("2", "auth_check", Some("1")),
        ])
        .unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(names(&tree, tree.roots()), vec!["request"]);
        let request = tree.roots()[0];
        assert_eq!(
            names(&tree, tree.children(Some(request))),
            vec!["auth_check", "render"]
        );
    }

    #[test]
    fn test_orphans_attach_to_virtual_root() {
        let tree = SpanTree::build(vec![
            span("a", "request", None),
            span("b", "lost_child", Some("missing")),
        ])
        .unwrap();
        assert_eq!(names(&tree, tree.roots()), vec!["lost_child", "request"]);
    }

    #[test]
    fn test_two_span_cycle_is_rejected() {
        let err = SpanTree::build(vec![
            span("a", "x", Some("b")),
            span("b", "y", Some("a")),
        ])
        .unwrap_err();
        assert!(matches!(err, StructuralError::Cycle { .. }));
    }

    #[test]
    fn test_self_parent_is_a_cycle() {
        let err = SpanTree::build(vec![span("a", "loop", Some("a"))]).unwrap_err();
        assert_eq!(
            err,
            StructuralError::Cycle {
                span_id: SpanId::new("a")
            }
        );
    }

    #[test]
    fn test_cycle_below_valid_root_is_found() {
        let err = SpanTree::build(vec![
            span("root", "request", None),
            span("c1", "a", Some("c3")),
            span("c2", "b", Some("c1")),
            span("c3", "c", Some("c2")),
            span("ok", "fine", Some("root")),
        ])
        .unwrap_err();
        assert!(matches!(err, StructuralError::Cycle { .. }));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let err = SpanTree::build(vec![span("a", "x", None), span("a", "y", None)]).unwrap_err();
        assert!(matches!(err, StructuralError::DuplicateSpan { .. }));
    }

    #[test]
    fn test_breadth_first_order() {
        let tree = SpanTree::build(vec![
            span("leaf", "z_leaf", Some("mid")),
            span("mid", "b_mid", Some("top")),
            span("top", "a_top", None),
            span("other", "c_other", None),
        ])
        .unwrap();
        let order: Vec<_> = tree
            .breadth_first()
            .map(|n| tree.span(n).id.to_string())
            .collect();
        assert_eq!(order, vec!["top", "other", "mid", "leaf"]);
    }

    #[test]
    fn test_same_name_siblings_ordered_by_start() {
        let tree = SpanTree::build(vec![
            Span::new("late", "retry", at_ms(20), at_ms(30)),
            Span::new("early", "retry", at_ms(0), at_ms(10)),
        ])
        .unwrap();
        let ids: Vec<_> = tree
            .roots()
            .iter()
            .map(|n| tree.span(*n).id.as_str())
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_flatten_rebuilds_same_shape() {
        let original = SpanTree::build(vec![
            span("c", "child", Some("r")),
            span("r", "root", None),
            span("g", "grandchild", Some("c")),
        ])
        .unwrap();
        let rebuilt = SpanTree::build(original.flatten()).unwrap();
        assert_eq!(rebuilt.flatten(), original.flatten());
    }

    #[test]
    fn test_empty_input() {
        let tree = SpanTree::build(Vec::new()).unwrap();
        assert!(tree.is_empty());
        assert!(tree.roots().is_empty());
        assert_eq!(tree.breadth_first().count(), 0);
    }
}
