use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use weave::Scheduler;

fn schedule_and_drain_thunks(c: &mut Criterion) {
    c.bench_function("schedule_and_drain_1000_thunks", |b| {
        b.iter(|| {
            let scheduler = Scheduler::new(2, true, 32);
            scheduler.start();
            let remaining = Arc::new(AtomicUsize::new(1000));
            for _ in 0..1000 {
                let remaining = remaining.clone();
                let scheduler_ref = scheduler.clone();
                scheduler.schedule(Box::new(move || {
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        scheduler_ref.stop();
                    }
                }));
            }
            scheduler.dispatch();
        });
    });
}

fn yielding_fiber_round_trips(c: &mut Criterion) {
    c.bench_function("yield_now_1000_times", |b| {
        b.iter(|| {
            let scheduler = Scheduler::new(1, true, 4);
            scheduler.start();
            let scheduler_ref = scheduler.clone();
            scheduler.schedule(Box::new(move || {
                for _ in 0..1000 {
                    weave::yield_now();
                }
                scheduler_ref.stop();
            }));
            scheduler.dispatch();
        });
    });
}

criterion_group!(benches, schedule_and_drain_thunks, yielding_fiber_round_trips);
criterion_main!(benches);
