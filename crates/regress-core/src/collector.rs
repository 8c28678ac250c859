//! Per-scenario span collection.
//!
//! Every running scenario gets its own [`SpanCollector`]; backends write to it
//! through cheap [`SpanRecorder`] clones, so concurrent scenarios never share a
//! buffer. Spans may arrive in any order. When the scenario finishes the buffer
//! is frozen and later records are dropped.

use chrono::Utc;
use regress_proto::{ScenarioId, Span, SpanId, SpanStatus};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Buffer {
    spans: Vec<Span>,
    ids: HashSet<SpanId>,
    frozen: bool,
}

#[derive(Debug)]
struct Shared {
    scenario: ScenarioId,
    buffer: Mutex<Buffer>,
    next_id: AtomicU64,
}

/// Owner of one scenario's span buffer.
#[derive(Debug)]
pub struct SpanCollector {
    shared: Arc<Shared>,
}

impl SpanCollector {
    pub fn new(scenario: ScenarioId) -> Self {
        Self {
            shared: Arc::new(Shared {
                scenario,
                buffer: Mutex::new(Buffer::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Handle passed to the execution backend.
    pub fn recorder(&self) -> SpanRecorder {
        SpanRecorder {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops accepting spans and returns everything recorded so far.
    pub fn freeze(self) -> Vec<Span> {
        let mut buffer = lock(&self.shared.buffer);
        buffer.frozen = true;
        buffer.ids.clear();
        debug!(
            scenario = %self.shared.scenario,
            spans = buffer.spans.len(),
            "Froze span buffer"
        );
        std::mem::take(&mut buffer.spans)
    }
}

/// Write handle into a scenario's span buffer.
#[derive(Debug, Clone)]
pub struct SpanRecorder {
    shared: Arc<Shared>,
}

impl SpanRecorder {
    pub fn scenario(&self) -> &ScenarioId {
        &self.shared.scenario
    }

    /// Appends a finished span. Returns false if it was dropped because the
    /// id is already taken or the buffer is frozen.
    pub fn record_span(&self, span: Span) -> bool {
        let mut buffer = lock(&self.shared.buffer);
        if buffer.frozen {
            debug!(scenario = %self.shared.scenario, span = %span.id, "Dropped span after freeze");
            return false;
        }
        if !buffer.ids.insert(span.id.clone()) {
            warn!(scenario = %self.shared.scenario, span = %span.id, "Dropped duplicate span id");
            return false;
        }
        buffer.spans.push(span);
        true
    }

    /// Opens a span starting now. Close it with [`ActiveSpan::finish`] or
    /// [`ActiveSpan::fail`].
    pub fn start_span(&self, name: impl Into<String>, parent: Option<&SpanId>) -> ActiveSpan {
        let id = SpanId::new(format!(
            "span-{}",
            self.shared.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let now = Utc::now();
        let mut span = Span::new(id, name, now, now);
        span.parent_id = parent.cloned();
        ActiveSpan {
            recorder: self.clone(),
            span: Some(span),
        }
    }

    /// Number of spans recorded so far.
    pub fn len(&self) -> usize {
        lock(&self.shared.buffer).spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A span that is still running.
///
/// Dropping it without closing records it with an error status, so partial
/// work stays visible in traces of cancelled scenarios.
#[derive(Debug)]
#[must_use = "an active span is recorded when finished or dropped"]
pub struct ActiveSpan {
    recorder: SpanRecorder,
    span: Option<Span>,
}

impl ActiveSpan {
    pub fn id(&self) -> Option<&SpanId> {
        self.span.as_ref().map(|s| &s.id)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        if let Some(span) = self.span.as_mut() {
            span.attributes.insert(key.into(), value.into());
        }
    }

    /// Opens a child of this span.
    pub fn child(&self, name: impl Into<String>) -> ActiveSpan {
        self.recorder.start_span(name, self.id())
    }

    pub fn finish(mut self) -> bool {
        self.close(SpanStatus::Ok)
    }

    pub fn fail(mut self, message: impl Into<String>) -> bool {
        self.close(SpanStatus::error(message))
    }

    fn close(&mut self, status: SpanStatus) -> bool {
        match self.span.take() {
            Some(mut span) => {
                span.end_time = Utc::now();
                span.status = status;
                self.recorder.record_span(span)
            }
            None => false,
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if self.span.is_some() {
            self.close(SpanStatus::error("span was not finished"));
        }
    }
}

fn lock(buffer: &Mutex<Buffer>) -> MutexGuard<'_, Buffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(name: &str) -> SpanCollector {
        SpanCollector::new(ScenarioId::new(name))
    }

    fn span(id: &str) -> Span {
        let now = Utc::now();
        Span::new(id, "step", now, now)
    }

    #[test]
    fn test_records_in_any_order() {
        let collector = collector("order");
        let recorder = collector.recorder();

        assert!(recorder.record_span(span("child").with_parent("root")));
        assert!(recorder.record_span(span("root")));

        let spans = collector.freeze();
        let ids: Vec<_> = spans.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["child", "root"]);
    }

    #[test]
    fn test_duplicate_ids_are_dropped() {
        let collector = collector("dupes");
        let recorder = collector.recorder();
        assert!(recorder.record_span(span("a")));
        assert!(!recorder.record_span(span("a")));
        assert_eq!(collector.freeze().len(), 1);
    }

    #[test]
    fn test_records_after_freeze_are_dropped() {
        let collector = collector("late");
        let recorder = collector.recorder();
        recorder.record_span(span("early"));

        let spans = collector.freeze();
        assert!(!recorder.record_span(span("late")));
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn test_active_span_links_children() {
        let collector = collector("nested");
        let recorder = collector.recorder();

        let mut request = recorder.start_span("request", None);
        request.set_attribute("http.method", "GET");
        let query = request.child("db_query");
        let parent_id = request.id().cloned();

        assert!(query.fail("timeout"));
        assert!(request.finish());

        let spans = collector.freeze();
        let query = spans.iter().find(|s| s.name == "db_query").unwrap();
        let request = spans.iter().find(|s| s.name == "request").unwrap();
        assert_eq!(query.parent_id, parent_id);
        assert_eq!(query.status, SpanStatus::error("timeout"));
        assert_eq!(request.attributes["http.method"], "GET");
        assert!(request.end_time >= request.start_time);
    }

    #[test]
    fn test_dropped_active_span_is_recorded_as_error() {
        let collector = collector("abandoned");
        let recorder = collector.recorder();
        {
            let _open = recorder.start_span("setup", None);
        }
        let spans = collector.freeze();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].status.is_error());
    }

    #[test]
    fn test_collectors_are_isolated() {
        let a = collector("a");
        let b = collector("b");
        let (ra, rb) = (a.recorder(), b.recorder());

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let (ra, rb) = (ra.clone(), rb.clone());
                std::thread::spawn(move || {
                    for n in 0..50 {
                        ra.record_span(span(&format!("a-{i}-{n}")));
                        rb.record_span(span(&format!("b-{i}-{n}")));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let a_spans = a.freeze();
        let b_spans = b.freeze();
        assert_eq!(a_spans.len(), 200);
        assert_eq!(b_spans.len(), 200);
        assert!(a_spans.iter().all(|s| s.id.as_str().starts_with("a-")));
        assert!(b_spans.iter().all(|s| s.id.as_str().starts_with("b-")));
    }
}
