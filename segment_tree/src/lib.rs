//! Transaction segment trees for application performance monitoring.
//!
//! [`segment-tree`] records the work done by one transaction as a tree of timed
//! segments. Segments may be started, ended, retimed and moved from any thread;
//! every structural change takes the transaction's lock. When the transaction
//! is finalized the tree is walked to compute each segment's exclusive time and
//! metric rollups, and to build a transaction trace and span events capped at
//! the configured [`SamplingLimits`]. When a cap is hit, the longest segments
//! are kept and each survivor is reattached to its nearest surviving ancestor.
//!
//! # Examples
//!
//! ## Direct use
//! ```rust
//! use segment_tree::{SamplingLimits, Transaction};
//!
//! let transaction = Transaction::new("WebTransaction/checkout");
//! let mut query = Some(
//!     transaction
//!         .start_segment(None, "select", "Datastore")
//!         .expect("the transaction is recording"),
//! );
//! transaction
//!     .end_segment(&mut query)
//!     .expect("the segment is still running");
//!
//! let finalized = transaction
//!     .finalize(SamplingLimits::default(), |total_time| {
//!         log::info!("total time: {total_time:?}")
//!     })
//!     .expect("first finalize");
//! assert_eq!(2, finalized.segment_count);
//! ```
//!
//! ## From `tracing` spans
//! ```rust
//! use segment_tree;
//! use log;
//!
//! // First, we decide where finished transactions go.
//! struct LogSink;
//! impl segment_tree::TransactionSink for LogSink {
//!     fn sink_transaction(&self, transaction: &segment_tree::FinalizedTransaction) {
//!         log::info!("transaction: {transaction:?}")
//!     }
//! }
//!
//! // Next, we configure a subscriber.
//! let level = "debug".parse().unwrap();
//! let subscriber = segment_tree::SegmentSubscriber::new(
//!     level,
//!     LogSink,
//!     segment_tree::SamplingLimits::default(),
//! );
//!
//! // Finally, we install the subscriber.
//! tracing::subscriber::set_global_default(subscriber)
//!     .expect("I should be able to set the global trace subscriber");
//!
//! // Every root span is now a transaction, and the spans beneath it segments.
//! ```

mod children;
mod error;
mod exclusive_time;
mod finalized;
mod limits;
mod retention_heap;
mod segment;
mod segment_subscriber;
mod transaction;
mod tree;
mod tree_sampler;

pub use children::SegmentChildren;
pub use children::INLINE_CHILDREN;
pub use error::SegmentError;
pub use error::SegmentResult;
pub use exclusive_time::ExclusiveTime;
pub use finalized::FinalizedTransaction;
pub use finalized::MetricRollup;
pub use finalized::SpanCategory;
pub use finalized::SpanDetail;
pub use finalized::SpanEvent;
pub use finalized::TraceDocument;
pub use finalized::TraceNode;
pub use limits::SamplingLimits;
pub use limits::DEFAULT_SPAN_LIMIT;
pub use limits::DEFAULT_TRACE_LIMIT;
pub use retention_heap::RetentionHeap;
pub use segment::AttributeValue;
pub use segment::DatastoreAttributes;
pub use segment::DatastoreInstance;
pub use segment::ExternalAttributes;
pub use segment::Segment;
pub use segment::SegmentId;
pub use segment::SegmentKind;
pub use segment::SegmentMetric;
pub use segment_subscriber::SegmentSubscriber;
pub use segment_subscriber::TransactionSink;
pub use transaction::SegmentHandle;
pub use transaction::SegmentRef;
pub use transaction::Transaction;
pub use tree::SegmentTree;
pub use tree::Step;
pub use tree_sampler::nearest_kept_ancestor;
pub use tree_sampler::TreeSampler;
