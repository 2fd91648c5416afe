//! Cost of recording into the latency histogram and the metrics aggregator.

use std::hint::black_box;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};
use loadbench::histogram::{Histogram, DEFAULT_BOUNDS_MS};
use loadbench::{MetricsAggregator, Outcome};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const THREADS: usize = 4;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("histogram");

    let histogram = Histogram::with_default_bounds();
    group.bench_function("observe_single_thread", |b| {
        let mut value = 0.0_f64;
        b.iter(|| {
            value = (value + 0.37) % 12_000.0;
            histogram.observe(black_box(value));
        });
    });

    let metrics = MetricsAggregator::new(&DEFAULT_BOUNDS_MS).unwrap();
    group.bench_function("record_success", |b| {
        b.iter(|| metrics.record(black_box(Outcome::Success(Duration::from_micros(750)))));
    });

    group.bench_function("observe_contended", |b| {
        b.iter_custom(|iters| {
            let histogram = Arc::new(Histogram::with_default_bounds());
            let barrier = Arc::new(Barrier::new(THREADS + 1));

            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let histogram = Arc::clone(&histogram);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        for i in 0..iters {
                            histogram.observe(black_box(((i as usize + t) % 5_000) as f64));
                        }
                    })
                })
                .collect();

            barrier.wait();
            let start = Instant::now();
            for handle in handles {
                handle.join().unwrap();
            }
            start.elapsed()
        });
    });

    group.bench_function("snapshot_and_reset", |b| {
        let histogram = Histogram::with_default_bounds();
        b.iter(|| {
            histogram.observe(1.5);
            black_box(histogram.snapshot_and_reset());
        });
    });

    group.finish();
}
