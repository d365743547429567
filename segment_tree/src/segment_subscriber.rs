use std::{
    collections::HashMap,
    sync::{atomic::AtomicU64, Mutex, MutexGuard},
};

use thread_local::ThreadLocal;
use tracing::{metadata::LevelFilter, span, Level, Metadata, Subscriber};

use crate::{FinalizedTransaction, SamplingLimits, SegmentHandle, SegmentRef, Transaction};

pub trait TransactionSink {
    fn sink_transaction(&self, transaction: &FinalizedTransaction);
}

struct SpanEntry {
    transaction: Transaction,
    segment: SegmentRef,
    /// `None` for the span that owns the transaction: closing it finalizes
    /// rather than ends a segment.
    handle: Option<SegmentHandle>,
    metadata: &'static Metadata<'static>,
    ref_count: usize,
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("{what} mutex was poisoned; continuing");
        poisoned.into_inner()
    })
}

/// Turns `tracing` spans into transactions. A span with no parent starts a
/// transaction and every span beneath it becomes a segment. When the
/// transaction's span closes, the transaction is finalized and handed to the
/// sink.
pub struct SegmentSubscriber<Sink> {
    id_counter: AtomicU64,
    spans: Mutex<HashMap<span::Id, SpanEntry>>,
    level: Option<Level>,
    active_span_stack: ThreadLocal<Mutex<Vec<span::Id>>>,
    sink: Sink,
    limits: SamplingLimits,
}

impl<Sink: TransactionSink> SegmentSubscriber<Sink> {
    pub fn new(level: LevelFilter, sink: Sink, limits: SamplingLimits) -> Self {
        Self {
            id_counter: Default::default(),
            spans: Default::default(),
            level: level.into_level(),
            active_span_stack: ThreadLocal::new(),
            sink,
            limits,
        }
    }

    fn insert_span(&self, id: span::Id, entry: SpanEntry) {
        lock_or_recover(&self.spans, "span").insert(id, entry);
    }

    fn use_span<T>(&self, id: &span::Id, use_it: impl FnOnce(&mut SpanEntry) -> T) -> Option<T> {
        lock_or_recover(&self.spans, "span").get_mut(id).map(use_it)
    }

    fn possibly_remove_span(
        &self,
        id: &span::Id,
        use_it: impl FnOnce(&mut SpanEntry) -> bool,
    ) -> Option<SpanEntry> {
        let mut spans = lock_or_recover(&self.spans, "span");
        match spans.get_mut(id).map(use_it) {
            Some(true) => spans.remove(id),
            _ => None,
        }
    }

    fn active_span(&self) -> Option<span::Id> {
        lock_or_recover(self.active_span_stack.get_or_default(), "active span stack")
            .last()
            .cloned()
    }

    fn parent_of(&self, attributes: &span::Attributes<'_>) -> Option<(Transaction, SegmentRef)> {
        let parent = match attributes.parent() {
            Some(parent) => Some(parent.clone()),
            None if attributes.is_contextual() => self.active_span(),
            None => None,
        }?;
        let found = self.use_span(&parent, |parent| (parent.transaction.clone(), parent.segment));
        if found.is_none() {
            log::debug!("could not find parent span {parent:?}");
        }
        found
    }

    fn start_transaction(&self, attributes: &span::Attributes<'_>) -> SpanEntry {
        let metadata = attributes.metadata();
        let transaction = Transaction::new(metadata.name());
        let segment = transaction.root();
        if let Err(e) = transaction.with_segment(segment, |root| attributes.record(root)) {
            log::debug!("could not record attributes on a new transaction: {e}");
        }
        SpanEntry {
            transaction,
            segment,
            handle: None,
            metadata,
            ref_count: 1,
        }
    }

    fn finish(&self, mut entry: SpanEntry) {
        match entry.handle.take() {
            Some(handle) => {
                let mut handle = Some(handle);
                if let Err(e) = entry.transaction.end_segment(&mut handle) {
                    log::debug!("could not end segment for {}: {e}", entry.metadata.name());
                }
            }
            None => match entry.transaction.finalize(self.limits, |total_time| {
                log::trace!("transaction {} total time {total_time:?}", entry.metadata.name())
            }) {
                Ok(finalized) => {
                    log::trace!("finalized transaction: {finalized:?}");
                    self.sink.sink_transaction(&finalized);
                }
                Err(e) => log::debug!("could not finalize {}: {e}", entry.metadata.name()),
            },
        }
    }
}

impl<Sink: TransactionSink + 'static> Subscriber for SegmentSubscriber<Sink> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        match &self.level {
            Some(level) => metadata.level() <= level,
            None => false,
        }
    }

    fn new_span(&self, attributes: &span::Attributes<'_>) -> span::Id {
        let mut id = self
            .id_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // tracing ids are not allowed to be 0.
        while id == 0 {
            id = self
                .id_counter
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        log::debug!("new span: {id} - {attributes:?}");
        let id = span::Id::from_u64(id);

        let metadata = attributes.metadata();
        let entry = match self.parent_of(attributes) {
            Some((transaction, parent)) => {
                match transaction.start_segment(Some(parent), metadata.name(), metadata.target()) {
                    Ok(handle) => {
                        if let Err(e) = handle.with_segment(|segment| attributes.record(segment)) {
                            log::debug!("could not record attributes on a new segment: {e}");
                        }
                        SpanEntry {
                            transaction,
                            segment: handle.segment(),
                            handle: Some(handle),
                            metadata,
                            ref_count: 1,
                        }
                    }
                    Err(e) => {
                        log::debug!("could not start a segment ({e}) - starting new transaction");
                        self.start_transaction(attributes)
                    }
                }
            }
            None => {
                log::debug!("no parent span - starting new transaction");
                self.start_transaction(attributes)
            }
        };

        self.insert_span(id.clone(), entry);
        id
    }

    fn record(&self, span: &span::Id, values: &span::Record<'_>) {
        let target = self.use_span(span, |entry| (entry.transaction.clone(), entry.segment));
        if let Some((transaction, segment)) = target {
            if let Err(e) = transaction.with_segment(segment, |segment| values.record(segment)) {
                log::debug!("could not record values on span {span:?}: {e}");
            }
        }
    }

    fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

    fn event(&self, _event: &tracing::Event<'_>) {}

    fn enter(&self, span: &span::Id) {
        let mut active_span_stack =
            lock_or_recover(self.active_span_stack.get_or_default(), "active span stack");
        log::trace!(
            "entering span. Current: {:?}, entering: {:?}",
            *active_span_stack,
            span
        );
        active_span_stack.push(span.clone());
    }

    fn exit(&self, span: &span::Id) {
        let mut active_span_stack =
            lock_or_recover(self.active_span_stack.get_or_default(), "active span stack");
        if active_span_stack.last() == Some(span) {
            active_span_stack.pop();
        } else {
            log::trace!(
                "tried to exit non-active span. Current: {:?}, attempted: {:?}",
                *active_span_stack,
                span
            );
        }
    }

    fn current_span(&self) -> tracing_core::span::Current {
        match self.active_span() {
            Some(span) => match self.use_span(&span, |entry| entry.metadata) {
                Some(metadata) => tracing_core::span::Current::new(span, metadata),
                None => tracing_core::span::Current::none(),
            },
            None => tracing_core::span::Current::none(),
        }
    }

    fn clone_span(&self, id: &span::Id) -> span::Id {
        self.use_span(id, |entry| entry.ref_count += 1);
        id.clone()
    }

    fn try_close(&self, id: span::Id) -> bool {
        let closed = self.possibly_remove_span(&id, |entry| {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.ref_count == 0
        });
        match closed {
            Some(entry) => {
                log::trace!("closed span {id:?}: {}", entry.metadata.name());
                self.finish(entry);
                true
            }
            None => false,
        }
    }
}
