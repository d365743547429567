use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use crate::{AttributeValue, DatastoreAttributes, ExternalAttributes, SegmentKind};

/// Everything a finished transaction hands to its sink.
#[derive(Debug, Clone)]
pub struct FinalizedTransaction {
    pub name: String,
    pub trace_id: [u8; 16],
    pub start: SystemTime,
    pub duration: Duration,

    /// Sum of every segment's exclusive time. This is a measure of work done and
    /// can exceed `duration` when segments ran concurrently.
    pub total_time: Duration,

    /// Segments in the tree when it was finalized, before any truncation.
    pub segment_count: usize,

    pub trace: Option<TraceDocument>,
    pub span_events: Option<Vec<SpanEvent>>,
    pub metrics: Vec<MetricRollup>,
}

/// The transaction trace: a (possibly truncated) copy of the segment tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceDocument {
    pub duration: Duration,
    /// Usually just the root segment. When truncation drops the root, each
    /// surviving subtree is listed here instead.
    pub nodes: Vec<TraceNode>,
}

impl TraceDocument {
    /// Number of nodes in the whole document.
    pub fn node_count(&self) -> usize {
        fn count(nodes: &[TraceNode]) -> usize {
            nodes.iter().map(|node| 1 + count(&node.children)).sum()
        }
        count(&self.nodes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceNode {
    pub start: Duration,
    pub stop: Duration,
    pub name: String,
    pub kind: SegmentKind,
    pub async_context: Option<String>,
    pub attributes: HashMap<&'static str, AttributeValue>,
    pub children: Vec<TraceNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanCategory {
    Generic,
    Datastore,
    Http,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpanDetail {
    Generic,
    Datastore {
        component: Option<String>,
        db_statement: Option<String>,
        db_instance: Option<String>,
        peer_address: String,
        peer_hostname: Option<String>,
    },
    Http {
        component: Option<String>,
        url: Option<String>,
        method: Option<String>,
    },
}

impl From<&SegmentKind> for SpanDetail {
    fn from(kind: &SegmentKind) -> Self {
        match kind {
            SegmentKind::Custom => Self::Generic,
            SegmentKind::Datastore(DatastoreAttributes {
                component,
                sql,
                sql_obfuscated,
                instance,
            }) => Self::Datastore {
                component: component.clone(),
                db_statement: sql.clone().or_else(|| sql_obfuscated.clone()),
                db_instance: instance.database_name.clone(),
                peer_address: format!(
                    "{}:{}",
                    instance.host.as_deref().unwrap_or("unknown"),
                    instance.port_path_or_id.as_deref().unwrap_or("unknown")
                ),
                peer_hostname: instance.host.clone(),
            },
            SegmentKind::External(ExternalAttributes {
                uri,
                library,
                procedure,
                ..
            }) => Self::Http {
                component: library.clone(),
                url: uri.clone(),
                method: procedure.clone(),
            },
        }
    }
}

/// One segment rendered as a span event.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    /// The nearest emitted ancestor's span id; `None` for the top span.
    pub parent_span_id: Option<[u8; 8]>,
    pub name: String,
    pub timestamp: SystemTime,
    pub duration: Duration,
    pub is_entry_point: bool,
    pub detail: SpanDetail,
    pub attributes: HashMap<&'static str, AttributeValue>,
}

impl SpanEvent {
    pub fn category(&self) -> SpanCategory {
        match self.detail {
            SpanDetail::Generic => SpanCategory::Generic,
            SpanDetail::Datastore { .. } => SpanCategory::Datastore,
            SpanDetail::Http { .. } => SpanCategory::Http,
        }
    }
}

/// Timings rolled up for every segment that asked for a given metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRollup {
    pub name: String,
    pub scoped: bool,
    pub count: u64,
    pub total: Duration,
    pub exclusive: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl MetricRollup {
    pub(crate) fn new(name: String, scoped: bool) -> Self {
        Self {
            name,
            scoped,
            count: 0,
            total: Duration::ZERO,
            exclusive: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    pub(crate) fn add(&mut self, duration: Duration, exclusive: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(duration);
        self.exclusive = self.exclusive.saturating_add(exclusive);
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }
}
