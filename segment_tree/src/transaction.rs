use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant, SystemTime},
};

use crate::{
    AttributeValue, FinalizedTransaction, SamplingLimits, Segment, SegmentError, SegmentId,
    SegmentKind, SegmentMetric, SegmentResult, SegmentTree, TreeSampler,
};

const UNNAMED_SEGMENT: &str = "Unnamed Segment";
const DEFAULT_CATEGORY: &str = "Custom";

/// Offsets are whole microseconds that fit in a `u64`.
const MAX_OFFSET: Duration = Duration::from_micros(u64::MAX);

static TRANSACTION_IDS: AtomicU64 = AtomicU64::new(1);

/// A plain reference to a segment, usable as a parent. It carries no right to
/// end the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentRef {
    transaction: u64,
    id: SegmentId,
}

impl SegmentRef {
    pub fn id(&self) -> SegmentId {
        self.id
    }
}

struct TransactionState {
    tree: SegmentTree,
    /// Segments started without an async context, innermost last. Used to
    /// pick a parent when none is given.
    open_segments: Vec<SegmentId>,
    recording: bool,
}

impl TransactionState {
    fn current_segment(&self) -> SegmentId {
        self.open_segments
            .last()
            .copied()
            .unwrap_or_else(|| self.tree.root())
    }

    fn retire(&mut self, id: SegmentId) {
        if self.open_segments.last() != Some(&id) {
            log::trace!("ended segment {id:?} out of order; leaving it on the open stack");
            return;
        }
        self.open_segments.pop();
        self.pop_finished();
    }

    /// Segments that ended out of order earlier are finished by now too.
    fn pop_finished(&mut self) {
        while let Some(top) = self.open_segments.last() {
            if !self.tree.get(*top).map_or(true, Segment::is_ended) {
                break;
            }
            self.open_segments.pop();
        }
    }
}

struct Shared {
    id: u64,
    name: String,
    trace_id: [u8; 16],
    start: SystemTime,
    clock: Instant,
    state: Mutex<TransactionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!("transaction {} lock was poisoned; continuing", self.name);
            poisoned.into_inner()
        })
    }

    fn lock_recording(&self) -> SegmentResult<MutexGuard<'_, TransactionState>> {
        let state = self.lock();
        if state.recording {
            Ok(state)
        } else {
            Err(SegmentError::NotRecording)
        }
    }

    /// Microseconds since the transaction started.
    fn now(&self) -> Duration {
        let micros = self.clock.elapsed().as_micros();
        Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    fn reference(&self, id: SegmentId) -> SegmentRef {
        SegmentRef {
            transaction: self.id,
            id,
        }
    }

    fn check(&self, segment: SegmentRef) -> SegmentResult<SegmentId> {
        if segment.transaction == self.id {
            Ok(segment.id)
        } else {
            Err(SegmentError::WrongTransaction)
        }
    }
}

/// A unit of monitored work and the tree of segments timing it.
///
/// Cloning is cheap and every clone refers to the same transaction. All
/// structural changes take one lock per transaction, held for the whole
/// operation, so segments can be started and ended from any thread.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

/// The right to end one segment. Ending consumes it.
pub struct SegmentHandle {
    shared: Arc<Shared>,
    id: SegmentId,
}

impl std::fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("transaction", &self.shared.id)
            .field("id", &self.id)
            .finish()
    }
}

fn segment_param(value: &str, default: &'static str) -> String {
    if value.contains('/') {
        log::debug!("segment name parts cannot include a slash: {value}");
        default.to_string()
    } else {
        value.to_string()
    }
}

impl Transaction {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Segment::new(name.clone(), String::new(), Duration::ZERO);
        let id = TRANSACTION_IDS.fetch_add(1, Ordering::Relaxed);
        log::debug!("new transaction: {id} - {name}");

        Self {
            shared: Arc::new(Shared {
                id,
                name,
                trace_id: rand::random(),
                start: SystemTime::now(),
                clock: Instant::now(),
                state: Mutex::new(TransactionState {
                    tree: SegmentTree::new(root),
                    open_segments: Vec::new(),
                    recording: true,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn trace_id(&self) -> [u8; 16] {
        self.shared.trace_id
    }

    pub fn root(&self) -> SegmentRef {
        self.shared.reference(self.shared.lock().tree.root())
    }

    /// The innermost segment that is still open, or the root.
    pub fn current_segment(&self) -> SegmentRef {
        self.shared.reference(self.shared.lock().current_segment())
    }

    pub fn segment_count(&self) -> usize {
        self.shared.lock().tree.segment_count()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.lock().recording
    }

    /// Runs `inspect` against the segment tree while holding the lock.
    pub fn inspect<T>(&self, inspect: impl FnOnce(&SegmentTree) -> T) -> T {
        inspect(&self.shared.lock().tree)
    }

    /// Runs `use_it` against any live segment of this transaction, the root
    /// included, while holding the lock.
    pub fn with_segment<T>(
        &self,
        segment: SegmentRef,
        use_it: impl FnOnce(&mut Segment) -> T,
    ) -> SegmentResult<T> {
        let id = self.shared.check(segment)?;
        let mut state = self.shared.lock_recording()?;
        state.tree.get_mut(id).map(use_it)
    }

    /// Starts a segment under `parent`, or under the innermost open segment
    /// when no parent is given.
    ///
    /// Either way the new segment becomes the innermost open segment until it
    /// ends, so later segments started without a parent nest under it. Use
    /// [`Transaction::start_async_segment`] for work that should stay out of
    /// that nesting.
    pub fn start_segment(
        &self,
        parent: Option<SegmentRef>,
        name: &str,
        category: &str,
    ) -> SegmentResult<SegmentHandle> {
        self.start(parent, name, category, None)
    }

    /// Starts a segment that runs concurrently with its parent. It does not
    /// become the current segment and does not reduce its parent's exclusive
    /// time.
    pub fn start_async_segment(
        &self,
        parent: Option<SegmentRef>,
        async_context: &str,
        name: &str,
        category: &str,
    ) -> SegmentResult<SegmentHandle> {
        self.start(parent, name, category, Some(async_context))
    }

    fn start(
        &self,
        parent: Option<SegmentRef>,
        name: &str,
        category: &str,
        async_context: Option<&str>,
    ) -> SegmentResult<SegmentHandle> {
        let explicit_parent = parent.map(|parent| self.shared.check(parent)).transpose()?;

        let mut state = self.shared.lock_recording()?;
        let parent = match explicit_parent {
            Some(parent) if state.tree.contains(parent) => parent,
            Some(parent) => return Err(SegmentError::UnknownSegment(parent.index())),
            None => state.current_segment(),
        };

        let mut segment = Segment::new(
            segment_param(name, UNNAMED_SEGMENT),
            segment_param(category, DEFAULT_CATEGORY),
            self.shared.now(),
        );
        segment.async_context = async_context.map(str::to_string);

        let id = state.tree.insert(segment, parent);
        if async_context.is_none() {
            state.open_segments.push(id);
        }
        log::trace!("started segment {id:?} under {parent:?}");

        Ok(SegmentHandle {
            shared: self.shared.clone(),
            id,
        })
    }

    /// Ends the segment and takes the handle. Unless its timing was set
    /// explicitly, the segment stops now.
    pub fn end_segment(&self, handle: &mut Option<SegmentHandle>) -> SegmentResult<()> {
        let Some(segment) = handle.as_ref() else {
            return Err(SegmentError::NullHandle);
        };
        if !Arc::ptr_eq(&segment.shared, &self.shared) {
            log::debug!("cannot end a segment on a different transaction to the one it was started on");
            return Err(SegmentError::WrongTransaction);
        }
        let id = segment.id;

        {
            let mut state = self.shared.lock_recording()?;
            let now = self.shared.now();
            let segment = state.tree.get_mut(id)?;
            if segment.ended {
                return Err(SegmentError::AlreadyEnded);
            }
            if segment.stop.is_none() {
                segment.stop = Some(now.max(segment.start));
            }
            segment.ended = true;
            let metric = segment.full_name();
            segment.metrics.push(SegmentMetric {
                name: metric,
                scoped: true,
            });
            state.retire(id);
        }

        *handle = None;
        Ok(())
    }

    /// Removes a segment from the tree. Its children move up to its parent.
    pub fn discard(&self, handle: SegmentHandle) -> SegmentResult<()> {
        if !Arc::ptr_eq(&handle.shared, &self.shared) {
            return Err(SegmentError::WrongTransaction);
        }
        let mut state = self.shared.lock_recording()?;
        state.tree.discard(handle.id)?;
        state.open_segments.retain(|open| *open != handle.id);
        state.pop_finished();
        Ok(())
    }

    /// Stops recording and reduces the tree to its bounded outputs.
    ///
    /// Segments still running are stopped now. `on_total_time` sees the total
    /// time before the outputs are built; it runs under the transaction lock
    /// and must not call back into this transaction.
    pub fn finalize(
        &self,
        limits: SamplingLimits,
        on_total_time: impl FnOnce(Duration),
    ) -> SegmentResult<FinalizedTransaction> {
        let mut state = self.shared.lock_recording()?;
        state.recording = false;
        state.open_segments.clear();

        let stopped = state.tree.end_all(self.shared.now());
        if 1 < stopped {
            log::debug!(
                "transaction {} finalized with {} segments still running",
                self.shared.name,
                stopped - 1
            );
        }

        let finalized = TreeSampler::new(
            &state.tree,
            &self.shared.name,
            self.shared.trace_id,
            self.shared.start,
        )
        .sample(limits, on_total_time);
        log::debug!(
            "finalized transaction {}: {} segments, total time {:?}",
            self.shared.name,
            finalized.segment_count,
            finalized.total_time
        );
        Ok(finalized)
    }
}

impl SegmentHandle {
    pub fn segment(&self) -> SegmentRef {
        self.shared.reference(self.id)
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Overrides the segment's timing. Offsets are relative to the start of
    /// the transaction.
    pub fn set_timing(&self, start: Duration, duration: Duration) -> SegmentResult<()> {
        let stop = start
            .checked_add(duration)
            .filter(|stop| *stop <= MAX_OFFSET)
            .ok_or(SegmentError::InvalidInterval {
                start,
                stop: start.saturating_add(duration),
            })?;
        let mut state = self.shared.lock_recording()?;
        let segment = state.tree.get_mut(self.id)?;
        if segment.ended {
            return Err(SegmentError::AlreadyEnded);
        }
        segment.start = start;
        segment.stop = Some(stop);
        Ok(())
    }

    /// Moves this segment under `new_parent`.
    pub fn reparent(&self, new_parent: SegmentRef) -> SegmentResult<()> {
        let new_parent = self.shared.check(new_parent)?;
        let mut state = self.shared.lock_recording()?;
        if state.tree.get_mut(self.id)?.ended {
            return Err(SegmentError::AlreadyEnded);
        }
        state.tree.set_parent(self.id, new_parent)
    }

    pub fn reparent_to_root(&self) -> SegmentResult<()> {
        let root = self.shared.lock().tree.root();
        self.reparent(self.shared.reference(root))
    }

    pub fn set_kind(&self, kind: SegmentKind) -> SegmentResult<()> {
        self.with_segment(|segment| segment.kind = kind)
    }

    pub fn record_attribute(&self, key: &'static str, value: AttributeValue) -> SegmentResult<()> {
        self.with_segment(|segment| {
            segment.attributes.insert(key, value);
        })
    }

    /// Rolls this segment's timings into the named metric at finalize.
    pub fn add_metric(&self, name: impl Into<String>, scoped: bool) -> SegmentResult<()> {
        let name = name.into();
        self.with_segment(|segment| segment.metrics.push(SegmentMetric { name, scoped }))
    }

    /// Runs `use_it` against the segment while holding the transaction lock.
    pub fn with_segment<T>(&self, use_it: impl FnOnce(&mut Segment) -> T) -> SegmentResult<T> {
        let mut state = self.shared.lock_recording()?;
        state.tree.get_mut(self.id).map(use_it)
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use super::{SegmentHandle, Transaction, MAX_OFFSET};
    use crate::{
        AttributeValue, ExternalAttributes, SamplingLimits, SegmentError, SegmentId, SegmentKind,
        SegmentTree, SpanCategory, Step,
    };

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn start(txn: &Transaction, name: &str) -> Option<SegmentHandle> {
        Some(txn.start_segment(None, name, "Custom").expect("transaction is recording"))
    }

    fn parent_of(txn: &Transaction, id: SegmentId) -> Option<SegmentId> {
        txn.inspect(|tree| tree[id].parent())
    }

    fn id_of(handle: &Option<SegmentHandle>) -> SegmentId {
        handle.as_ref().expect("handle is live").id()
    }

    #[test]
    fn segments_nest_under_the_innermost_open_segment() {
        let txn = Transaction::new("WebTransaction/nesting");
        let root = txn.root().id();

        let mut a = start(&txn, "a");
        let mut b = start(&txn, "b");
        assert_eq!(Some(root), parent_of(&txn, id_of(&a)));
        assert_eq!(Some(id_of(&a)), parent_of(&txn, id_of(&b)));

        let a_id = id_of(&a);
        txn.end_segment(&mut b).expect("b is live");
        let mut c = start(&txn, "c");
        assert_eq!(Some(a_id), parent_of(&txn, id_of(&c)));
        txn.end_segment(&mut c).expect("c is live");
        txn.end_segment(&mut a).expect("a is live");

        let d = start(&txn, "d");
        assert_eq!(Some(root), parent_of(&txn, id_of(&d)));
        assert_eq!(5, txn.segment_count());
    }

    #[test]
    fn out_of_order_ends_do_not_pop_the_wrong_segment() {
        let txn = Transaction::new("t");
        let mut a = start(&txn, "a");
        let mut b = start(&txn, "b");
        let b_id = id_of(&b);

        txn.end_segment(&mut a).expect("a is live");
        assert_eq!(b_id, txn.current_segment().id());

        txn.end_segment(&mut b).expect("b is live");
        assert_eq!(txn.root(), txn.current_segment());
    }

    #[test]
    fn explicit_parents_win() {
        let txn = Transaction::new("t");
        let a = start(&txn, "a");
        let _b = start(&txn, "b");
        let a_ref = a.as_ref().expect("live").segment();

        let c = txn
            .start_segment(Some(a_ref), "c", "Custom")
            .expect("a is in this transaction");
        assert_eq!(Some(a_ref.id()), parent_of(&txn, c.id()));
        let root_child = txn
            .start_segment(Some(txn.root()), "d", "Custom")
            .expect("root is in this transaction");
        assert_eq!(Some(txn.root().id()), parent_of(&txn, root_child.id()));
    }

    #[test]
    fn foreign_segments_are_refused() {
        let txn = Transaction::new("one");
        let other = Transaction::new("two");
        let mut foreign = start(&other, "foreign");
        let foreign_ref = foreign.as_ref().expect("live").segment();

        assert_eq!(
            SegmentError::WrongTransaction,
            txn.start_segment(Some(foreign_ref), "x", "Custom")
                .expect_err("parent is foreign")
        );
        assert_eq!(
            Err(SegmentError::WrongTransaction),
            txn.end_segment(&mut foreign)
        );
        assert!(foreign.is_some(), "a refused end keeps the handle");

        let local = start(&txn, "local");
        assert_eq!(
            Err(SegmentError::WrongTransaction),
            local.as_ref().expect("live").reparent(foreign_ref)
        );
        other.end_segment(&mut foreign).expect("right transaction");
    }

    #[test]
    fn ending_takes_the_handle() {
        let txn = Transaction::new("t");
        let mut a = start(&txn, "a");
        let id = id_of(&a);
        txn.end_segment(&mut a).expect("a is live");
        assert!(a.is_none());
        assert_eq!(Err(SegmentError::NullHandle), txn.end_segment(&mut a));
        assert!(txn.inspect(|tree| tree[id].is_ended()));
    }

    #[test]
    fn explicit_timing_survives_end() {
        let txn = Transaction::new("t");
        let mut a = start(&txn, "a");
        let handle = a.as_ref().expect("live");
        handle.set_timing(ms(10), ms(30)).expect("not ended");
        let id = handle.id();
        txn.end_segment(&mut a).expect("a is live");

        let (start, stop) = txn.inspect(|tree| (tree[id].start(), tree[id].stop()));
        assert_eq!(ms(10), start);
        assert_eq!(Some(ms(40)), stop);
    }

    #[test]
    fn running_segments_can_move_under_ended_ones() {
        let txn = Transaction::new("t");
        let mut a = start(&txn, "a");
        let b = start(&txn, "b");
        let b_handle = b.as_ref().expect("live");
        let a_ref = a.as_ref().expect("live").segment();

        txn.end_segment(&mut a).expect("a is live");
        b_handle.reparent(txn.root()).expect("b is still running");
        assert_eq!(Some(txn.root().id()), parent_of(&txn, b_handle.id()));
        b_handle.reparent(a_ref).expect("ended parents still adopt");
        assert_eq!(Some(a_ref.id()), parent_of(&txn, b_handle.id()));
    }

    #[test]
    fn set_timing_after_end_fails() {
        let txn = Transaction::new("t");
        let a = txn.start_segment(None, "a", "Custom").expect("recording");
        let stale = SegmentHandle {
            shared: Arc::clone(&a.shared),
            id: a.id(),
        };
        let mut a = Some(a);
        txn.end_segment(&mut a).expect("a is live");
        assert_eq!(Err(SegmentError::AlreadyEnded), stale.set_timing(ms(1), ms(1)));
        assert_eq!(Err(SegmentError::AlreadyEnded), stale.reparent(txn.root()));
    }

    #[test]
    fn reparenting_onto_a_descendant_fails_and_changes_nothing() {
        let txn = Transaction::new("t");
        let a = start(&txn, "a");
        let b = start(&txn, "b");
        let c = start(&txn, "c");
        let a_handle = a.as_ref().expect("live");
        let c_ref = c.as_ref().expect("live").segment();

        let before = txn.inspect(|tree| {
            (0..4)
                .map(|index| tree[SegmentId(index)].parent())
                .collect::<Vec<_>>()
        });
        assert_eq!(Err(SegmentError::Cycle), a_handle.reparent(c_ref));
        assert_eq!(Err(SegmentError::Cycle), a_handle.reparent(a_handle.segment()));
        let after = txn.inspect(|tree| {
            (0..4)
                .map(|index| tree[SegmentId(index)].parent())
                .collect::<Vec<_>>()
        });
        assert_eq!(before, after);
        assert_eq!(Some(id_of(&b)), parent_of(&txn, c_ref.id()));
    }

    #[test]
    fn reparent_to_root() {
        let txn = Transaction::new("t");
        let _a = start(&txn, "a");
        let b = start(&txn, "b");
        let b_handle = b.as_ref().expect("live");
        b_handle.reparent_to_root().expect("root is not below b");
        assert_eq!(Some(txn.root().id()), parent_of(&txn, b_handle.id()));
        assert_eq!(2, txn.inspect(|tree| tree[tree.root()].children().len()));
    }

    #[test]
    fn slashes_are_not_allowed_in_names() {
        let txn = Transaction::new("t");
        let a = txn
            .start_segment(None, "a/b", "My/Category")
            .expect("recording");
        let name = txn.inspect(|tree| tree[a.id()].full_name());
        assert_eq!("Custom/Unnamed Segment", name);
    }

    #[test]
    fn discard_reparents_children() {
        let txn = Transaction::new("t");
        let a = start(&txn, "a").expect("live");
        let b = start(&txn, "b");
        let a_id = a.id();
        txn.discard(a).expect("a is not the root");

        assert_eq!(2, txn.segment_count());
        assert_eq!(Some(txn.root().id()), parent_of(&txn, id_of(&b)));
        assert!(txn.inspect(|tree| tree.get(a_id).is_none()));
    }

    #[test]
    fn attributes_and_kinds_reach_the_segment() {
        let txn = Transaction::new("t");
        let a = start(&txn, "a").expect("live");
        a.record_attribute("user", AttributeValue::String("bob".to_string()))
            .expect("recording");
        a.set_kind(SegmentKind::External(ExternalAttributes {
            uri: Some("https://example.com/pay".to_string()),
            ..Default::default()
        }))
        .expect("recording");
        a.add_metric("Custom/extra", false).expect("recording");

        let finalized = txn
            .finalize(SamplingLimits::default(), |_| {})
            .expect("recording");
        let metric_names: Vec<&str> = finalized
            .metrics
            .iter()
            .map(|metric| metric.name.as_str())
            .collect();
        assert_eq!(vec!["Custom/extra"], metric_names);
        let trace = finalized.trace.expect("traces are on");
        assert_eq!(
            Some(&AttributeValue::String("bob".to_string())),
            trace.nodes[0].children[0].attributes.get("user")
        );
        let spans = finalized.span_events.expect("spans are on");
        assert_eq!(SpanCategory::Http, spans[1].category());
        assert_eq!(SpanCategory::Generic, spans[0].category());
    }

    #[test]
    fn finalize_stops_recording() {
        let txn = Transaction::new("WebTransaction/done");
        let mut a = start(&txn, "a");
        let running = start(&txn, "running");
        txn.end_segment(&mut a).expect("a is live");

        let mut totals = Vec::new();
        let finalized = txn
            .finalize(SamplingLimits::default(), |total| totals.push(total))
            .expect("first finalize");
        assert_eq!(vec![finalized.total_time], totals);
        assert_eq!(3, finalized.segment_count);
        assert_eq!("WebTransaction/done", finalized.name);
        assert_eq!(txn.trace_id(), finalized.trace_id);
        assert!(!txn.is_recording());
        assert!(txn.inspect(|tree| {
            let mut all_ended = true;
            tree.walk(|step| {
                if let Step::Enter(id) = step {
                    all_ended &= tree[id].is_ended();
                }
            });
            all_ended
        }));

        assert_eq!(
            SegmentError::NotRecording,
            txn.finalize(SamplingLimits::default(), |_| {})
                .expect_err("already finalized")
        );
        assert_eq!(
            SegmentError::NotRecording,
            txn.start_segment(None, "late", "Custom")
                .expect_err("already finalized")
        );
        assert_eq!(
            Err(SegmentError::NotRecording),
            running.as_ref().expect("live").set_timing(ms(1), ms(1))
        );
    }

    #[test]
    fn finalize_uses_explicit_timings() {
        let txn = Transaction::new("t");
        let mut a = start(&txn, "a");
        let mut b = start(&txn, "b");
        a.as_ref().expect("live").set_timing(ms(10), ms(40)).expect("running");
        b.as_ref().expect("live").set_timing(ms(20), ms(10)).expect("running");
        txn.end_segment(&mut b).expect("b is live");
        txn.end_segment(&mut a).expect("a is live");

        let finalized = txn
            .finalize(SamplingLimits::default(), |_| {})
            .expect("recording");
        let rollups: Vec<(&str, Duration, Duration)> = finalized
            .metrics
            .iter()
            .map(|metric| (metric.name.as_str(), metric.total, metric.exclusive))
            .collect();
        assert_eq!(
            vec![("Custom/a", ms(40), ms(30)), ("Custom/b", ms(10), ms(10))],
            rollups
        );
    }

    #[test]
    fn async_segments_stay_off_the_stack() {
        let txn = Transaction::new("t");
        let a = start(&txn, "a");
        let a_ref = a.as_ref().expect("live").segment();
        let background = txn
            .start_async_segment(None, "worker", "poll", "Custom")
            .expect("recording");
        assert_eq!(a_ref, txn.current_segment());
        assert_eq!(Some(a_ref.id()), parent_of(&txn, background.id()));
        assert_eq!(
            Some("worker".to_string()),
            txn.inspect(|tree| tree[background.id()].async_context.clone())
        );
    }

    #[test]
    fn timings_past_the_offset_range_are_refused() {
        let txn = Transaction::new("t");
        let a = start(&txn, "a");
        let handle = a.as_ref().expect("live");

        assert!(matches!(
            handle.set_timing(Duration::MAX, Duration::ZERO),
            Err(SegmentError::InvalidInterval { .. })
        ));
        assert!(matches!(
            handle.set_timing(MAX_OFFSET, Duration::from_micros(1)),
            Err(SegmentError::InvalidInterval { .. })
        ));
        assert_eq!(Ok(()), handle.set_timing(MAX_OFFSET, Duration::ZERO));
        assert_eq!(Some(MAX_OFFSET), txn.inspect(|tree| tree[handle.id()].stop()));
    }

    #[test]
    fn finalize_survives_the_longest_accepted_timings() {
        let txn = Transaction::new("t");
        for _ in 0..2 {
            let mut sibling = Some(
                txn.start_segment(Some(txn.root()), "a", "Custom")
                    .expect("recording"),
            );
            sibling
                .as_ref()
                .expect("live")
                .set_timing(Duration::ZERO, MAX_OFFSET)
                .expect("within the offset range");
            txn.end_segment(&mut sibling).expect("sibling is live");
        }
        let mut last = start(&txn, "late");
        last.as_ref()
            .expect("live")
            .set_timing(MAX_OFFSET, Duration::ZERO)
            .expect("within the offset range");
        txn.end_segment(&mut last).expect("late is live");

        let finalized = txn
            .finalize(SamplingLimits::default(), |_| {})
            .expect("recording");
        assert!(MAX_OFFSET * 2 <= finalized.total_time);
        assert_eq!(MAX_OFFSET * 2, finalized.metrics[0].total);
        assert!(!txn.shared.state.is_poisoned());
    }

    #[test]
    fn explicitly_parented_segments_become_current() {
        let txn = Transaction::new("t");
        let a = start(&txn, "a");
        let a_id = id_of(&a);

        let worker = txn
            .start_segment(Some(txn.root()), "worker", "Custom")
            .expect("recording");
        let b = start(&txn, "b");
        assert_eq!(Some(worker.id()), parent_of(&txn, id_of(&b)));

        let background = txn
            .start_async_segment(Some(txn.root()), "pool", "job", "Custom")
            .expect("recording");
        let c = start(&txn, "c");
        assert_eq!(Some(id_of(&b)), parent_of(&txn, id_of(&c)));
        assert_ne!(background.id(), txn.current_segment().id());
        assert_ne!(Some(background.id()), parent_of(&txn, a_id));
    }

    #[test]
    fn discard_leaves_no_ended_segment_current() {
        let txn = Transaction::new("t");
        let mut a = start(&txn, "a");
        let b = start(&txn, "b").expect("live");

        txn.end_segment(&mut a).expect("a is live");
        assert_eq!(b.id(), txn.current_segment().id());

        txn.discard(b).expect("b is not the root");
        assert_eq!(txn.root(), txn.current_segment());
        let c = start(&txn, "c");
        assert_eq!(Some(txn.root().id()), parent_of(&txn, id_of(&c)));
    }

    #[test]
    fn concurrent_children_of_one_parent() {
        const THREADS: usize = 16;
        let txn = Transaction::new("t");
        let parent = start(&txn, "parent");
        let parent_ref = parent.as_ref().expect("live").segment();

        std::thread::scope(|scope| {
            for i in 0..THREADS {
                let txn = &txn;
                scope.spawn(move || {
                    let mut child = Some(
                        txn.start_segment(Some(parent_ref), &format!("child {i}"), "Custom")
                            .expect("recording"),
                    );
                    child
                        .as_ref()
                        .expect("live")
                        .reparent(parent_ref)
                        .expect("parent is not below the child");
                    txn.end_segment(&mut child).expect("child is live");
                    assert!(child.is_none());
                });
            }
        });

        let children = txn.inspect(|tree: &SegmentTree| tree[parent_ref.id()].children().len());
        assert_eq!(THREADS, children);
        assert_eq!(parent_ref, txn.current_segment());
        assert_eq!(THREADS + 2, txn.segment_count());
    }
}
