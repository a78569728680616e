//! Benchmarks for async pool dispatch and completion draining.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use prefork_core::event::AsyncEvent;
use prefork_module::{CompletionPipe, FixedPool, PoolConfig};
use std::sync::Arc;

#[derive(Debug)]
struct Noop(u64);

fn noop_handler(ev: &mut AsyncEvent) {
    let n = ev.request::<Noop>().map(|r| r.0).unwrap_or(0);
    ev.retval = Some(n as isize);
}

/// Dispatch `batch` events and wait until all of them are drained.
fn round_trip(pool: &FixedPool, pipe: &CompletionPipe, batch: usize, tokens: &mut Vec<u64>) {
    for i in 0..batch {
        while !pool.dispatch(AsyncEvent::new(Noop(i as u64)), noop_handler) {
            std::hint::spin_loop();
        }
    }
    let mut done = 0;
    while done < batch {
        tokens.clear();
        let _ = pipe.drain(tokens);
        while let Some(ev) = pool.pop_completed() {
            black_box(ev.retval);
            done += 1;
        }
    }
}

fn bench_dispatch_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_round_trip");

    for threads in [1usize, 4].iter() {
        let pipe = Arc::new(CompletionPipe::create().unwrap());
        let pool = FixedPool::new(PoolConfig { threads: *threads, max_pending: 4096 }, pipe.clone()).unwrap();
        let mut tokens = Vec::with_capacity(1024);

        group.bench_with_input(BenchmarkId::new("batch_256", threads), threads, |b, _| {
            b.iter(|| round_trip(&pool, &pipe, black_box(256), &mut tokens));
        });
    }

    group.finish();
}

fn bench_completion_pipe(c: &mut Criterion) {
    use prefork_core::Notifier;

    let pipe = CompletionPipe::create().unwrap();
    let mut out = Vec::with_capacity(64);
    c.bench_function("completion_pipe_notify_drain_64", |b| {
        b.iter(|| {
            for i in 0..64u64 {
                pipe.notify(black_box(i)).unwrap();
            }
            out.clear();
            black_box(pipe.drain(&mut out).unwrap())
        });
    });
}

criterion_group!(benches, bench_dispatch_round_trip, bench_completion_pipe);
criterion_main!(benches);
