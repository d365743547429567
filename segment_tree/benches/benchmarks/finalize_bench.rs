use criterion::{black_box, criterion_group, BatchSize, Criterion};
use segment_tree::{SamplingLimits, Transaction};

/// A transaction with `segments` segments, each nested under one of the
/// segments started before it.
fn build(segments: usize) -> Transaction {
    let transaction = Transaction::new("WebTransaction/bench");
    let mut started = vec![transaction.root()];
    for i in 0..segments {
        let parent = started[(i * 31 + 7) % started.len()];
        let mut handle = Some(
            transaction
                .start_segment(Some(parent), "work", "Custom")
                .expect("bench transaction is recording"),
        );
        if let Some(handle) = &handle {
            started.push(handle.segment());
        }
        transaction
            .end_segment(&mut handle)
            .expect("bench segment is live");
    }
    transaction
}

fn finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("Finalize");

    for segments in [100, 5_000] {
        group.bench_function(format!("{segments} segments, default limits"), |bencher| {
            bencher.iter_batched(
                || build(segments),
                |transaction| {
                    black_box(
                        transaction
                            .finalize(SamplingLimits::default(), |_| {})
                            .expect("bench transaction is recording"),
                    )
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.bench_function("5000 segments, truncated to 100", |bencher| {
        bencher.iter_batched(
            || build(5_000),
            |transaction| {
                black_box(
                    transaction
                        .finalize(SamplingLimits::new(100, 100), |_| {})
                        .expect("bench transaction is recording"),
                )
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("start and end", |bencher| {
        let transaction = Transaction::new("WebTransaction/bench");
        bencher.iter(|| {
            let mut handle = Some(
                transaction
                    .start_segment(None, "work", "Custom")
                    .expect("bench transaction is recording"),
            );
            transaction
                .end_segment(black_box(&mut handle))
                .expect("bench segment is live");
        })
    });
}

criterion_group!(benches, finalize);
