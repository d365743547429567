use std::{collections::HashMap, time::Duration};

use tracing::field::Visit;

use crate::SegmentChildren;

/// Index of a segment within its transaction's arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub(crate) usize);

impl SegmentId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatastoreInstance {
    pub host: Option<String>,
    pub port_path_or_id: Option<String>,
    pub database_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatastoreAttributes {
    /// The name of the database vendor or driver.
    pub component: Option<String>,
    pub sql: Option<String>,
    pub sql_obfuscated: Option<String>,
    pub instance: DatastoreInstance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalAttributes {
    pub uri: Option<String>,
    pub library: Option<String>,
    /// Also known as the method.
    pub procedure: Option<String>,
    pub transaction_guid: Option<String>,
}

/// What a segment was timing. Datastore and external calls carry extra
/// attributes into the trace and span event outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SegmentKind {
    #[default]
    Custom,
    Datastore(DatastoreAttributes),
    External(ExternalAttributes),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    F64(f64),
    I64(i64),
    U64(u64),
    I128(i128),
    U128(u128),
    Bool(bool),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMetric {
    pub name: String,
    pub scoped: bool,
}

/// One timed node of a transaction's tree.
///
/// Times are offsets from the start of the owning transaction. A `None` stop
/// means the segment is still open.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub category: String,
    pub kind: SegmentKind,

    /// Segments in a different async context than their parent ran concurrently
    /// with it, so they do not eat into the parent's exclusive time.
    pub async_context: Option<String>,

    /// The id used when this segment is emitted as a span event.
    pub span_id: [u8; 8],

    pub(crate) start: Duration,
    pub(crate) stop: Option<Duration>,
    pub(crate) ended: bool,

    pub(crate) parent: Option<SegmentId>,
    pub(crate) children: SegmentChildren,
    pub(crate) discarded: bool,

    pub attributes: HashMap<&'static str, AttributeValue>,
    pub metrics: Vec<SegmentMetric>,
}

impl Segment {
    pub(crate) fn new(name: String, category: String, start: Duration) -> Self {
        Self {
            name,
            category,
            kind: SegmentKind::default(),
            async_context: None,
            span_id: rand::random(),
            start,
            stop: None,
            ended: false,
            parent: None,
            children: SegmentChildren::new(),
            discarded: false,
            attributes: HashMap::new(),
            metrics: Vec::new(),
        }
    }

    /// `category/name`, which is how the segment is named in traces and metrics.
    /// The root segment has no category and goes by the transaction name.
    pub fn full_name(&self) -> String {
        if self.category.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.category, self.name)
        }
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn stop(&self) -> Option<Duration> {
        self.stop
    }

    pub fn parent(&self) -> Option<SegmentId> {
        self.parent
    }

    pub fn children(&self) -> &SegmentChildren {
        &self.children
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Stop time, or `start` for a segment that never stopped.
    pub fn stop_or_start(&self) -> Duration {
        self.stop.unwrap_or(self.start)
    }

    /// Wall duration; zero if the recorded stop precedes the start.
    pub fn duration(&self) -> Duration {
        self.stop_or_start().saturating_sub(self.start)
    }
}

impl Visit for Segment {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.attributes
            .insert(field.name(), AttributeValue::String(format!("{value:?}")));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.attributes
            .insert(field.name(), AttributeValue::F64(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.attributes
            .insert(field.name(), AttributeValue::I64(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.attributes
            .insert(field.name(), AttributeValue::U64(value));
    }

    fn record_i128(&mut self, field: &tracing::field::Field, value: i128) {
        self.attributes
            .insert(field.name(), AttributeValue::I128(value));
    }

    fn record_u128(&mut self, field: &tracing::field::Field, value: u128) {
        self.attributes
            .insert(field.name(), AttributeValue::U128(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.attributes
            .insert(field.name(), AttributeValue::Bool(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.attributes
            .insert(field.name(), AttributeValue::String(value.to_owned()));
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.attributes
            .insert(field.name(), AttributeValue::Error(format!("{value:?}")));
    }
}
