//! Execution-thread lifecycle benchmarks.

use criterion::{Criterion, criterion_group, criterion_main};
use evthread_core::{Entry, Thread, ThreadStack, time};

fn bench_spawn_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_lifecycle");

    group.bench_function("construct_destroy", |b| {
        b.iter(|| drop(criterion::black_box(Thread::new())));
    });

    group.bench_function("spawn_join_default_stack", |b| {
        b.iter(|| {
            let _ = Thread::new()
                .start("bench", None, 0, Entry::function(|| {}))
                .join();
        });
    });

    group.bench_function("spawn_join_caller_stack", |b| {
        b.iter(|| {
            let Ok(stack) = ThreadStack::allocate(256 * 1024) else {
                return;
            };
            let _ = Thread::new()
                .start("bench", Some(stack), 0, Entry::function(|| {}))
                .join();
        });
    });

    group.finish();
}

fn bench_cached_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("cur_time");
    group.bench_function("read", |b| b.iter(time::cur_time));
    group.bench_function("refresh", |b| b.iter(time::refresh_cur_time));
    group.finish();
}

criterion_group!(benches, bench_spawn_join, bench_cached_time);
criterion_main!(benches);
