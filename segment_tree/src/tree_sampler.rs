use std::{
    collections::{BTreeMap, HashSet},
    time::{Duration, SystemTime},
};

use crate::{
    tree::Step, ExclusiveTime, FinalizedTransaction, MetricRollup, RetentionHeap, SamplingLimits,
    Segment, SegmentId, SegmentTree, SpanDetail, SpanEvent, TraceDocument, TraceNode,
};

/// Which segments make it into one output.
#[derive(Debug)]
enum Selection {
    Everything,
    Kept(HashSet<SegmentId>),
}

impl Selection {
    fn from_heap(heap: Option<RetentionHeap>) -> Self {
        match heap {
            Some(heap) => Self::Kept(heap.into_sorted_segments().into_iter().collect()),
            None => Self::Everything,
        }
    }

    fn includes(&self, id: SegmentId) -> bool {
        match self {
            Self::Everything => true,
            Self::Kept(kept) => kept.contains(&id),
        }
    }
}

struct FirstPass {
    total_time: Duration,
    metrics: BTreeMap<(String, bool), MetricRollup>,
    trace_heap: Option<RetentionHeap>,
    span_heap: Option<RetentionHeap>,
}

/// Walks the segment tree of a transaction that has stopped recording and
/// builds its bounded outputs.
///
/// The first walk sums exclusive time, rolls up metrics, and (only for an output
/// whose limit the tree exceeds) keeps the longest segments in a bounded heap.
/// The second walk emits the trace and span events. Segments that did not make
/// the cut are skipped, and their surviving descendants are attached to the
/// nearest surviving ancestor.
pub struct TreeSampler<'a> {
    tree: &'a SegmentTree,
    name: &'a str,
    trace_id: [u8; 16],
    start: SystemTime,
}

impl<'a> TreeSampler<'a> {
    pub fn new(tree: &'a SegmentTree, name: &'a str, trace_id: [u8; 16], start: SystemTime) -> Self {
        Self {
            tree,
            name,
            trace_id,
            start,
        }
    }

    pub fn sample(
        &self,
        limits: SamplingLimits,
        on_total_time: impl FnOnce(Duration),
    ) -> FinalizedTransaction {
        let segment_count = self.tree.segment_count();
        let truncate_trace = limits.traces_enabled() && limits.trace_limit < segment_count;
        let truncate_spans = limits.spans_enabled() && limits.span_limit < segment_count;

        let first_pass = self.first_pass(
            truncate_trace.then(|| RetentionHeap::new(limits.trace_limit)),
            truncate_spans.then(|| RetentionHeap::new(limits.span_limit)),
        );
        log::trace!(
            "first pass over {segment_count} segments: total time {:?}",
            first_pass.total_time
        );
        on_total_time(first_pass.total_time);

        let trace_selection = limits
            .traces_enabled()
            .then(|| Selection::from_heap(first_pass.trace_heap));
        let span_selection = limits
            .spans_enabled()
            .then(|| Selection::from_heap(first_pass.span_heap));

        let (trace, span_events) = if trace_selection.is_some() || span_selection.is_some() {
            self.second_pass(trace_selection.as_ref(), span_selection.as_ref())
        } else {
            (None, None)
        };

        FinalizedTransaction {
            name: self.name.to_string(),
            trace_id: self.trace_id,
            start: self.start,
            duration: self.tree[self.tree.root()].duration(),
            total_time: first_pass.total_time,
            segment_count,
            trace,
            span_events,
            metrics: first_pass.metrics.into_values().collect(),
        }
    }

    fn first_pass(
        &self,
        mut trace_heap: Option<RetentionHeap>,
        mut span_heap: Option<RetentionHeap>,
    ) -> FirstPass {
        let mut total_time = Duration::ZERO;
        let mut metrics: BTreeMap<(String, bool), MetricRollup> = BTreeMap::new();

        self.tree.walk(|step| {
            let Step::Enter(id) = step else {
                return;
            };
            let segment = &self.tree[id];
            let duration = segment.duration();
            let exclusive = self.exclusive_time(segment);
            total_time = total_time.saturating_add(exclusive);

            for metric in &segment.metrics {
                metrics
                    .entry((metric.name.clone(), metric.scoped))
                    .or_insert_with(|| MetricRollup::new(metric.name.clone(), metric.scoped))
                    .add(duration, exclusive);
            }

            if let Some(heap) = trace_heap.as_mut() {
                heap.offer(id, duration);
            }
            if let Some(heap) = span_heap.as_mut() {
                heap.offer(id, duration);
            }
        });

        FirstPass {
            total_time,
            metrics,
            trace_heap,
            span_heap,
        }
    }

    fn exclusive_time(&self, segment: &Segment) -> Duration {
        let mut exclusive = match ExclusiveTime::new(segment.start, segment.stop_or_start()) {
            Ok(exclusive) => exclusive,
            Err(e) => {
                log::debug!("no exclusive time for segment {}: {e}", segment.full_name());
                return Duration::ZERO;
            }
        };

        for child in segment.children().iter().filter_map(|id| self.tree.get(id)) {
            // A child in another async context ran alongside its parent.
            if child.async_context != segment.async_context {
                continue;
            }
            if let Err(e) = exclusive.add_child(child.start, child.stop_or_start()) {
                log::debug!("ignoring child {} for exclusive time: {e}", child.full_name());
            }
        }

        exclusive.calculate()
    }

    fn second_pass(
        &self,
        trace_selection: Option<&Selection>,
        span_selection: Option<&Selection>,
    ) -> (Option<TraceDocument>, Option<Vec<SpanEvent>>) {
        // The emitted ancestors of the segment currently being visited.
        let mut trace_path: Vec<(SegmentId, TraceNode)> = Vec::new();
        let mut trace_nodes: Vec<TraceNode> = Vec::new();
        let mut span_events: Vec<SpanEvent> = Vec::new();

        self.tree.walk(|step| match step {
            Step::Enter(id) => {
                let segment = &self.tree[id];
                if trace_selection.is_some_and(|selection| selection.includes(id)) {
                    trace_path.push((id, self.trace_node(segment)));
                }
                if let Some(selection) = span_selection {
                    if selection.includes(id) {
                        span_events.push(self.span_event(id, selection));
                    }
                }
            }
            Step::Exit(id) => {
                if !matches!(trace_path.last(), Some((top, _)) if *top == id) {
                    return;
                }
                if let Some((_, node)) = trace_path.pop() {
                    match trace_path.last_mut() {
                        Some((_, parent)) => parent.children.push(node),
                        None => trace_nodes.push(node),
                    }
                }
            }
        });

        let trace = trace_selection.map(|_| TraceDocument {
            duration: self.tree[self.tree.root()].duration(),
            nodes: trace_nodes,
        });
        (trace, span_selection.map(|_| span_events))
    }

    fn trace_node(&self, segment: &Segment) -> TraceNode {
        let stop = segment.stop_or_start();
        if stop < segment.start {
            log::debug!(
                "segment {} stopped at {stop:?} before it started at {:?}",
                segment.full_name(),
                segment.start
            );
        }
        TraceNode {
            start: segment.start,
            stop: stop.max(segment.start),
            name: segment.full_name(),
            kind: segment.kind.clone(),
            async_context: segment.async_context.clone(),
            attributes: segment.attributes.clone(),
            children: Vec::new(),
        }
    }

    fn timestamp(&self, segment: &Segment) -> SystemTime {
        self.start.checked_add(segment.start).unwrap_or_else(|| {
            log::debug!(
                "segment {} starts too far after its transaction at {:?}",
                segment.full_name(),
                segment.start
            );
            self.start
        })
    }

    fn span_event(&self, id: SegmentId, selection: &Selection) -> SpanEvent {
        let segment = &self.tree[id];
        let parent = match selection {
            Selection::Everything => segment.parent(),
            Selection::Kept(kept) => nearest_kept_ancestor(self.tree, kept, id),
        };
        SpanEvent {
            trace_id: self.trace_id,
            span_id: segment.span_id,
            parent_span_id: parent
                .and_then(|parent| self.tree.get(parent))
                .map(|parent| parent.span_id),
            name: segment.full_name(),
            timestamp: self.timestamp(segment),
            duration: segment.duration(),
            is_entry_point: id == self.tree.root(),
            detail: SpanDetail::from(&segment.kind),
            attributes: segment.attributes.clone(),
        }
    }
}

/// The closest ancestor of `id` that is in `kept`.
///
/// Gives up at the root, so a parent chain that loops back on itself cannot
/// keep the search going.
pub fn nearest_kept_ancestor(
    tree: &SegmentTree,
    kept: &HashSet<SegmentId>,
    id: SegmentId,
) -> Option<SegmentId> {
    let root = tree.root();
    let mut current = tree.get(id)?.parent();
    for _ in 0..tree.segment_count() {
        let candidate = current?;
        if kept.contains(&candidate) {
            return Some(candidate);
        }
        if candidate == root {
            return None;
        }
        current = tree.get(candidate)?.parent();
    }
    None
}
