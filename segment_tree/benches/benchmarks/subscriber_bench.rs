use criterion::{black_box, criterion_group, Criterion};
use segment_tree::{FinalizedTransaction, SamplingLimits, SegmentSubscriber, TransactionSink};
use tracing::{metadata::LevelFilter, Instrument, Level};

struct NoSink;
impl TransactionSink for NoSink {
    fn sink_transaction(&self, _transaction: &FinalizedTransaction) {}
}

fn trace(c: &mut Criterion) {
    let mut group = c.benchmark_group("Subscriber");

    let subscriber = SegmentSubscriber::new(LevelFilter::DEBUG, NoSink, SamplingLimits::default());

    tracing::subscriber::with_default(subscriber, || {
        group.bench_function("root with one segment", |bencher| {
            bencher.iter(|| {
                let span = tracing::span!(Level::INFO, "bench");
                let _guard = black_box(span.enter());
                span.record("some", 42);
                {
                    let child_span = tracing::span!(parent: &span, Level::DEBUG, "subspan");
                    let _a = async {}.instrument(child_span);
                }
            })
        });
    });
}

criterion_group!(benches, trace);
