//! `parallel_do` / `parallel_foreach`: fiber-based fork-join combinators built on [`Scheduler`].
//!
//! Both combinators degrade to plain sequential execution when called outside of a scheduler
//! (e.g. from a test's `main` thread), so library code can use them without checking first.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::log::{weave_log, Level};
use crate::scheduler::{current, current_handle, yield_to_scheduler, Thunk};

type Payload = Box<dyn Any + Send>;

/// Runs a batch of thunks, at most `parallelism` of them concurrently, and waits for all of them
/// to finish before returning.
///
/// If the first thunk to panic is observed, its payload is re-raised on the caller once every
/// worker has either finished or abandoned its remaining queue; thunks that haven't started yet
/// are dropped rather than run.
///
/// `parallelism = None` means "one worker per thunk". Called with no scheduler running on the
/// current thread, thunks run sequentially in order instead.
pub fn parallel_do(thunks: Vec<Thunk>, parallelism: Option<usize>) {
    let total = thunks.len();
    if total == 0 {
        return;
    }

    let scheduler = match current() {
        Some(scheduler) => scheduler,
        None => {
            weave_log!(Level::Debug, "parallel", "no scheduler on this thread, running {} thunks sequentially", total);
            for thunk in thunks {
                thunk();
            }
            return;
        }
    };

    let workers = parallelism.unwrap_or(total).clamp(1, total);
    let queue = Arc::new(Mutex::new(VecDeque::from(thunks)));
    let panic_slot: Arc<Mutex<Option<Payload>>> = Arc::new(Mutex::new(None));
    let remaining = Arc::new(AtomicUsize::new(workers));
    let caller = current_handle().expect("parallel_do called outside a fiber");

    for _ in 0..workers {
        let queue = queue.clone();
        let panic_slot = panic_slot.clone();
        let remaining = remaining.clone();
        let caller = caller.clone();
        let wake_on = scheduler.clone();

        scheduler.schedule(Box::new(move || {
            loop {
                if panic_slot.lock().expect("parallel lock poisoned").is_some() {
                    break;
                }
                let next = queue.lock().expect("parallel lock poisoned").pop_front();
                let thunk = match next {
                    Some(thunk) => thunk,
                    None => break,
                };
                if let Err(payload) = catch_unwind(AssertUnwindSafe(thunk)) {
                    let mut slot = panic_slot.lock().expect("parallel lock poisoned");
                    if slot.is_none() {
                        *slot = Some(payload);
                    }
                    break;
                }
            }
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                wake_on.schedule_handle(caller);
            }
        }));
    }

    yield_to_scheduler();

    let panicked = panic_slot.lock().expect("parallel lock poisoned").take();
    if let Some(payload) = panicked {
        resume_unwind(payload);
    }
}

/// Applies `functor` to every item of `iter`, using up to `parallelism` concurrent workers that
/// pull the next item from a shared queue.
///
/// Ordering across workers is undefined; on a single-threaded scheduler it matches iteration
/// order. Stops early (abandoning unconsumed items) on the first panic, which is re-raised on the
/// caller. Falls back to sequential application with no current scheduler.
pub fn parallel_foreach<T, F>(iter: impl IntoIterator<Item = T>, functor: F, parallelism: usize)
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let scheduler = match current() {
        Some(scheduler) => scheduler,
        None => {
            weave_log!(Level::Debug, "parallel", "no scheduler on this thread, applying functor sequentially");
            for item in iter {
                functor(item);
            }
            return;
        }
    };

    let items: VecDeque<T> = iter.into_iter().collect();
    if items.is_empty() {
        return;
    }

    let workers = parallelism.max(1).min(items.len());
    let queue = Arc::new(Mutex::new(items));
    let functor = Arc::new(functor);
    let panic_slot: Arc<Mutex<Option<Payload>>> = Arc::new(Mutex::new(None));
    let remaining = Arc::new(AtomicUsize::new(workers));
    let caller = current_handle().expect("parallel_foreach called outside a fiber");

    for _ in 0..workers {
        let queue = queue.clone();
        let functor = functor.clone();
        let panic_slot = panic_slot.clone();
        let remaining = remaining.clone();
        let caller = caller.clone();
        let wake_on = scheduler.clone();

        scheduler.schedule(Box::new(move || {
            loop {
                if panic_slot.lock().expect("parallel lock poisoned").is_some() {
                    break;
                }
                let next = queue.lock().expect("parallel lock poisoned").pop_front();
                let item = match next {
                    Some(item) => item,
                    None => break,
                };
                let functor = functor.clone();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| functor(item))) {
                    let mut slot = panic_slot.lock().expect("parallel lock poisoned");
                    if slot.is_none() {
                        *slot = Some(payload);
                    }
                    break;
                }
            }
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                wake_on.schedule_handle(caller);
            }
        }));
    }

    yield_to_scheduler();

    let panicked = panic_slot.lock().expect("parallel lock poisoned").take();
    if let Some(payload) = panicked {
        resume_unwind(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn parallel_do_runs_every_thunk() {
        let scheduler = Scheduler::new(2, true, 4);
        scheduler.start();
        let sum = Arc::new(AtomicI64::new(0));
        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            let thunks: Vec<Thunk> = (1..=10i64)
                .map(|n| {
                    let sum = sum.clone();
                    Box::new(move || {
                        sum.fetch_add(n, Ordering::SeqCst);
                    }) as Thunk
                })
                .collect();
            parallel_do(thunks, Some(4));
            assert_eq!(sum.load(Ordering::SeqCst), 55);
            scheduler_ref.stop();
        }));
        scheduler.dispatch();
    }

    #[test]
    fn parallel_do_propagates_first_panic() {
        let scheduler = Scheduler::new(1, false, 4);
        scheduler.start();
        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                let thunks: Vec<Thunk> = vec![
                    Box::new(|| {}),
                    Box::new(|| panic!("boom")),
                ];
                parallel_do(thunks, Some(1));
            }));
            assert!(result.is_err());
            scheduler_ref.stop();
        }));
        scheduler.stop();
    }

    #[test]
    fn parallel_foreach_applies_every_item() {
        let scheduler = Scheduler::new(2, true, 4);
        scheduler.start();
        let sum = Arc::new(AtomicI64::new(0));
        let scheduler_ref = scheduler.clone();
        let sum_for_fiber = sum.clone();
        scheduler.schedule(Box::new(move || {
            parallel_foreach(
                1..=100i64,
                move |n| {
                    sum_for_fiber.fetch_add(n, Ordering::SeqCst);
                },
                4,
            );
            scheduler_ref.stop();
        }));
        scheduler.dispatch();
        assert_eq!(sum.load(Ordering::SeqCst), 5050);
    }
}
