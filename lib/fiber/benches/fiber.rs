use criterion::{criterion_group, criterion_main, Criterion};
use fiber::Fiber;

fn create_and_run(c: &mut Criterion) {
    c.bench_function("create_and_run", |b| {
        b.iter(|| {
            let fiber = Fiber::new(64 * 1024, |_yielder| {});
            let _ = unsafe { fiber.call() };
        });
    });
}

fn suspend_resume(c: &mut Criterion) {
    c.bench_function("suspend_resume", |b| {
        b.iter(|| {
            let fiber = Fiber::new(64 * 1024, |yielder| loop {
                yielder.suspend();
            });
            let mut fiber = unsafe { fiber.call() };
            for _ in 0..100 {
                fiber = unsafe { fiber.call() };
            }
        });
    });
}

criterion_group!(benches, create_and_run, suspend_resume);
criterion_main!(benches);
