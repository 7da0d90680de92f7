//! The M:N dispatch core: a work queue with optional thread affinity, serviced by a fixed pool
//! of OS worker threads, each multiplexing any number of fibers.
//!
//! The dispatch loop mirrors the batch/affinity/idle algorithm of a classic cooperative
//! scheduler: pull up to `batch_size` runnable items whose affinity matches this worker, run
//! them to their next suspension point, and fall back to an idle backend (a plain condvar park
//! by default, or an I/O manager's readiness/completion wait) when there's nothing to do.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::resume_unwind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use fiber::{Fiber, State as FiberState};

use crate::config::{resolve_thread_count, ConfigSource};
use crate::log::{weave_log, Level};

const DEFAULT_STACK_SIZE: usize = 64 * 1024;

pub type Thunk = Box<dyn FnOnce() + Send>;

/// Hook a scheduler delegates to when it has no runnable work: block until something shows up.
///
/// An I/O manager implements this to wait on its readiness/completion object; a scheduler with
/// no attached I/O manager uses [`ParkBackend`], a plain condvar.
pub trait IdleBackend: Send + Sync {
    /// Blocks the calling worker until there's new work, a tickle, or `timeout` elapses.
    fn block(&self, timeout: Option<Duration>);
    /// Wakes a worker that might be parked inside `block`.
    fn tickle(&self);
    /// Extra quiescence condition `stop()` waits on, beyond "queue empty and no active workers".
    fn is_quiescent(&self) -> bool {
        true
    }
}

/// The default idle backend: a condvar park with no I/O integration.
#[derive(Default)]
pub struct ParkBackend {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl IdleBackend for ParkBackend {
    fn block(&self, timeout: Option<Duration>) {
        let guard = self.lock.lock().expect("scheduler park lock poisoned");
        match timeout {
            Some(timeout) => {
                let _ = self.condvar.wait_timeout(guard, timeout);
            }
            None => {
                let _guard = self.condvar.wait(guard);
            }
        }
    }

    fn tickle(&self) {
        self.condvar.notify_all();
    }
}

struct FiberHandleInner {
    fiber: Mutex<Option<Fiber>>,
    requeue: AtomicBool,
}

/// A reschedulable reference to a suspended fiber.
///
/// Holding a clone of a `FiberHandle` is how I/O managers, timers, and the pipe stream rendezvous
/// wake a fiber that parked itself on them: they take the `Fiber` back out and hand it to
/// [`Scheduler::schedule_handle`].
#[derive(Clone)]
pub struct FiberHandle(Arc<FiberHandleInner>);

impl FiberHandle {
    fn take(&self) -> Option<Fiber> {
        self.0.fiber.lock().expect("fiber handle poisoned").take()
    }

    fn put(&self, fiber: Fiber) {
        *self.0.fiber.lock().expect("fiber handle poisoned") = Some(fiber);
    }

    fn set_requeue(&self, value: bool) {
        self.0.requeue.store(value, Ordering::SeqCst);
    }

    fn take_requeue(&self) -> bool {
        self.0.requeue.swap(true, Ordering::SeqCst)
    }
}

pub(crate) enum Runnable {
    Handle(FiberHandle),
    Thunk(Thunk),
}

struct QueueItem {
    runnable: Runnable,
    target: Option<ThreadId>,
}

struct FiberContext {
    yielder: fiber::Yielder,
    scheduler: Mutex<Arc<Scheduler>>,
    handle: FiberHandle,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<FiberContext>>> = const { RefCell::new(None) };
}

fn current_context() -> Option<Arc<FiberContext>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Suspends the current fiber, returning control to the dispatch loop.
///
/// Used internally by [`yield_now`], I/O registration, timer waits, and the pipe stream
/// rendezvous. Every suspension point in the crate routes through here so thread-local state is
/// correctly re-established after a resume that lands on a different OS thread.
pub(crate) fn park() {
    let ctx = current_context().expect("attempted to suspend outside of a fiber");
    ctx.yielder.suspend();
    CURRENT.with(|cell| *cell.borrow_mut() = Some(ctx));
}

pub(crate) fn current_handle() -> Option<FiberHandle> {
    current_context().map(|ctx| ctx.handle.clone())
}

/// Returns the scheduler the currently running fiber belongs to, if any.
pub fn current() -> Option<Arc<Scheduler>> {
    current_context().map(|ctx| ctx.scheduler.lock().expect("fiber context poisoned").clone())
}

/// Suspends the current fiber and reschedules it on its own scheduler.
///
/// It may resume on a different worker thread unless it was scheduled with thread affinity.
pub fn yield_now() {
    let ctx = current_context().expect("yield_now called outside of a fiber");
    ctx.handle.set_requeue(true);
    park();
}

/// Suspends the current fiber without rescheduling it.
///
/// The caller is responsible for arranging a future [`Scheduler::schedule_handle`] call (an I/O
/// callback, a timer, a pipe peer) — otherwise the fiber parks forever.
pub fn yield_to_scheduler() {
    let ctx = current_context().expect("yield_to_scheduler called outside of a fiber");
    ctx.handle.set_requeue(false);
    park();
}

struct Counters {
    active: AtomicUsize,
    idle: AtomicUsize,
}

/// A work queue serviced by a pool of OS worker threads running cooperative fibers.
pub struct Scheduler {
    queue: Mutex<VecDeque<QueueItem>>,
    thread_count: AtomicUsize,
    batch_size: usize,
    hijack: bool,
    stopping: AtomicBool,
    root_thread: Mutex<Option<ThreadId>>,
    threads: Mutex<Vec<ThreadId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    backend: Mutex<Arc<dyn IdleBackend>>,
    counters: Counters,
}

impl Scheduler {
    /// Creates a new scheduler. `hijack_caller`, when true, counts the constructing thread as
    /// one of the `thread_count` workers; it participates only once [`Scheduler::dispatch`] is
    /// called on it.
    pub fn new(thread_count: usize, hijack_caller: bool, batch_size: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            queue: Mutex::new(VecDeque::new()),
            thread_count: AtomicUsize::new(thread_count.max(1)),
            batch_size: batch_size.max(1),
            hijack: hijack_caller,
            stopping: AtomicBool::new(true),
            root_thread: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            backend: Mutex::new(Arc::new(ParkBackend::default())),
            counters: Counters { active: AtomicUsize::new(0), idle: AtomicUsize::new(0) },
        })
    }

    /// Creates a scheduler sized from `weave.scheduler.threads` (see [`resolve_thread_count`]),
    /// defaulting to one worker per available core when the key is unset.
    pub fn from_config(config: &dyn ConfigSource, hijack_caller: bool, batch_size: usize) -> Arc<Scheduler> {
        let configured = config.get_int("weave.scheduler.threads").unwrap_or(-1);
        Scheduler::new(resolve_thread_count(configured), hijack_caller, batch_size)
    }

    /// Swaps in an I/O-aware idle backend. Must be called before [`Scheduler::start`].
    pub fn set_backend(&self, backend: Arc<dyn IdleBackend>) {
        *self.backend.lock().expect("scheduler lock poisoned") = backend;
    }

    fn backend(&self) -> Arc<dyn IdleBackend> {
        self.backend.lock().expect("scheduler lock poisoned").clone()
    }

    /// Starts the configured worker threads (minus one, if hijacking the caller).
    pub fn start(self: &Arc<Self>) {
        self.stopping.store(false, Ordering::SeqCst);

        if self.hijack {
            let id = thread::current().id();
            *self.root_thread.lock().expect("scheduler lock poisoned") = Some(id);
            self.threads.lock().expect("scheduler lock poisoned").push(id);
        }

        let target = self.thread_count.load(Ordering::SeqCst);
        let to_spawn = if self.hijack { target.saturating_sub(1) } else { target };

        let mut workers = self.workers.lock().expect("scheduler lock poisoned");
        for _ in 0..to_spawn {
            let scheduler = self.clone();
            workers.push(thread::spawn(move || worker_loop(scheduler)));
        }
    }

    /// Runs the dispatch loop on the calling thread until the queue is drained and the
    /// scheduler is stopping. Only meaningful for a hijacking scheduler's constructing thread.
    pub fn dispatch(self: &Arc<Self>) {
        worker_loop(self.clone());
    }

    /// Idempotently signals shutdown, wakes every worker, and joins the ones this scheduler
    /// spawned. Existing queued work still runs to completion before workers exit.
    pub fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);
        self.backend().tickle();

        let workers = std::mem::take(&mut *self.workers.lock().expect("scheduler lock poisoned"));
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Resizes the worker pool. Shrinking asks surplus threads to retire on their next dispatch
    /// iteration rather than interrupting in-flight work.
    pub fn set_thread_count(self: &Arc<Self>, thread_count: usize) {
        let thread_count = thread_count.max(1);
        let previous = self.thread_count.swap(thread_count, Ordering::SeqCst);
        if thread_count > previous {
            let mut workers = self.workers.lock().expect("scheduler lock poisoned");
            for _ in 0..(thread_count - previous) {
                let scheduler = self.clone();
                workers.push(thread::spawn(move || worker_loop(scheduler)));
            }
        } else if thread_count < previous {
            self.backend().tickle();
        }
    }

    /// Preserved extension seam: not consulted by the core dispatch loop, available for a
    /// downstream idle policy to check before deciding whether to spin up more work.
    pub fn has_idle_threads(&self) -> bool {
        self.counters.idle.load(Ordering::SeqCst) > 0
    }

    fn should_tickle(self: &Arc<Self>, was_empty: bool) -> bool {
        was_empty && current().map(|running_on| !Arc::ptr_eq(&running_on, self)).unwrap_or(true)
    }

    /// Appends a runnable to the queue, optionally pinned to a specific worker thread.
    pub(crate) fn schedule_raw(self: &Arc<Self>, runnable: Runnable, target: Option<ThreadId>) {
        let was_empty = {
            let mut queue = self.queue.lock().expect("scheduler lock poisoned");
            let was_empty = queue.is_empty();
            queue.push_back(QueueItem { runnable, target });
            was_empty
        };
        if self.should_tickle(was_empty) {
            self.backend().tickle();
        }
    }

    /// Schedules a thunk to run on any worker.
    pub fn schedule(self: &Arc<Self>, thunk: Thunk) {
        self.schedule_raw(Runnable::Thunk(thunk), None);
    }

    /// Schedules a thunk pinned to a specific worker thread.
    pub fn schedule_on(self: &Arc<Self>, thunk: Thunk, thread: ThreadId) {
        self.schedule_raw(Runnable::Thunk(thunk), Some(thread));
    }

    pub(crate) fn schedule_handle(self: &Arc<Self>, handle: FiberHandle) {
        self.schedule_raw(Runnable::Handle(handle), None);
    }

    pub(crate) fn schedule_handle_on(self: &Arc<Self>, handle: FiberHandle, thread: ThreadId) {
        self.schedule_raw(Runnable::Handle(handle), Some(thread));
    }

    /// Moves the currently running fiber onto this scheduler (optionally pinned to `thread`)
    /// and suspends; it resumes here once rescheduled.
    pub fn switch_to(self: &Arc<Self>, thread: Option<ThreadId>) {
        let ctx = current_context().expect("switch_to called outside of a fiber");
        *ctx.scheduler.lock().expect("fiber context poisoned") = self.clone();
        match thread {
            Some(thread) => self.schedule_handle_on(ctx.handle.clone(), thread),
            None => self.schedule_handle(ctx.handle.clone()),
        }
        yield_to_scheduler();
    }

    fn queue_len(&self) -> usize {
        self.queue.lock().expect("scheduler lock poisoned").len()
    }

    fn is_stopping_and_drained(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.queue_len() == 0
            && self.counters.active.load(Ordering::SeqCst) == 0
            && self.backend().is_quiescent()
    }

    /// Called by a worker at the top of its own dispatch loop. If this worker is surplus to the
    /// configured thread count, cancels its idle fiber (if parked in [`FiberState::Hold`]) via
    /// [`fiber::Fiber::cancel`] before reporting that the worker should retire, mirroring how a
    /// shrinking scheduler unwinds its idle fiber rather than abandoning it mid-wait.
    fn maybe_retire(self: &Arc<Self>) -> bool {
        let id = thread::current().id();
        let is_root = self.root_thread.lock().expect("scheduler lock poisoned").map(|r| r == id).unwrap_or(false);
        if is_root {
            return false;
        }
        let mut threads = self.threads.lock().expect("scheduler lock poisoned");
        if threads.len() > self.thread_count.load(Ordering::SeqCst) {
            threads.retain(|t| *t != id);
            let oversized = threads.len() > self.thread_count.load(Ordering::SeqCst);
            drop(threads);
            if oversized {
                self.backend().tickle();
            }
            IDLE_FIBER.with(|cell| {
                if let Some(fiber) = cell.borrow_mut().take() {
                    let _ = fiber.cancel();
                }
            });
            return true;
        }
        false
    }

    fn take_batch(&self, worker: ThreadId) -> (Vec<QueueItem>, bool) {
        let mut queue = self.queue.lock().expect("scheduler lock poisoned");
        let mut batch = Vec::new();
        let mut tickle_me = false;
        let mut remaining = VecDeque::new();

        while let Some(item) = queue.pop_front() {
            if batch.len() >= self.batch_size {
                remaining.push_back(item);
                continue;
            }
            match item.target {
                Some(thread) if thread != worker => {
                    tickle_me = true;
                    remaining.push_back(item);
                }
                _ => batch.push(item),
            }
        }
        remaining.extend(queue.drain(..));
        *queue = remaining;

        (batch, tickle_me)
    }

    fn requeue_front(&self, items: Vec<QueueItem>) {
        let mut queue = self.queue.lock().expect("scheduler lock poisoned");
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }
}

thread_local! {
    /// Per-worker dedicated fiber for running scheduled [`Thunk`]s, reused via [`Fiber::reset`]
    /// instead of allocating a fresh stack for every thunk. Only ever holds a fiber that finished
    /// its previous thunk (`Term`/`Except`); one that suspends mid-thunk is handed off to the
    /// normal [`Runnable::Handle`] path and this slot is left empty until the next thunk arrives.
    static THUNK_FIBER: RefCell<Option<Fiber>> = const { RefCell::new(None) };
    /// Per-worker fiber that runs the idle wait loop, so a shrinking scheduler can cancel a
    /// parked worker through [`Fiber::cancel`] instead of abandoning a bare-thread blocking call.
    static IDLE_FIBER: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

fn bind_fiber_context(scheduler: Arc<Scheduler>, handle: FiberHandle, yielder: fiber::Yielder, body: Box<dyn FnOnce() + Send>) {
    let ctx = Arc::new(FiberContext { yielder, scheduler: Mutex::new(scheduler), handle });
    CURRENT.with(|cell| *cell.borrow_mut() = Some(ctx));
    body();
    CURRENT.with(|cell| *cell.borrow_mut() = None);
}

/// Spawns `body` onto this worker's dedicated thunk fiber, resetting it in place when one is
/// cached from a previous thunk, falling back to a fresh [`Fiber::new`] otherwise.
fn spawn_thunk(scheduler: Arc<Scheduler>, body: Thunk) -> FiberHandle {
    let handle = FiberHandle(Arc::new(FiberHandleInner { fiber: Mutex::new(None), requeue: AtomicBool::new(true) }));
    let handle_for_entry = handle.clone();
    let entry = move |yielder: fiber::Yielder| {
        bind_fiber_context(scheduler, handle_for_entry, yielder, body);
    };

    let cached = THUNK_FIBER.with(|cell| cell.borrow_mut().take());
    let fiber = match cached {
        Some(fiber) => fiber.reset(DEFAULT_STACK_SIZE, entry),
        None => Fiber::new(DEFAULT_STACK_SIZE, entry),
    };
    handle.put(fiber);
    handle
}

/// Runs one queue item to its next suspension point. Returns `Err` with the panic payload if
/// the fiber's entry point unwound.
fn run_one(scheduler: &Arc<Scheduler>, item: QueueItem) -> Result<(), Box<dyn std::any::Any + Send>> {
    let (handle, is_thunk) = match item.runnable {
        Runnable::Handle(handle) => (handle, false),
        Runnable::Thunk(thunk) => (spawn_thunk(scheduler.clone(), thunk), true),
    };

    let fiber = handle.take().expect("scheduled fiber handle was empty");
    let fiber = unsafe { fiber.call() };

    match fiber.state() {
        FiberState::Term => {
            if is_thunk {
                THUNK_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
            }
            Ok(())
        }
        FiberState::Except => {
            let payload = fiber.take_panic().unwrap_or_else(|| Box::new("fiber panicked with no payload"));
            if is_thunk {
                THUNK_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
            }
            Err(payload)
        }
        FiberState::Hold => {
            let requeue = handle.take_requeue();
            handle.put(fiber);
            if requeue {
                scheduler.schedule_handle(handle);
            }
            Ok(())
        }
        FiberState::Init | FiberState::Exec => unreachable!("fiber left call() in an impossible state"),
    }
}

/// Entry point for a worker's dedicated idle fiber: blocks on the scheduler's [`IdleBackend`],
/// then suspends to hand control back to `worker_loop`, looping for as long as it's resumed.
/// A shrinking scheduler cancels this fiber (see [`Scheduler::maybe_retire`]) instead of ever
/// resuming it again.
fn idle_body(scheduler: Arc<Scheduler>, yielder: fiber::Yielder) {
    loop {
        scheduler.backend().block(None);
        yielder.suspend();
    }
}

fn worker_loop(scheduler: Arc<Scheduler>) {
    fiber::init();
    let worker = thread::current().id();

    loop {
        if scheduler.maybe_retire() {
            return;
        }

        let (batch, tickle_me) = scheduler.take_batch(worker);
        if tickle_me {
            scheduler.backend().tickle();
        }

        if batch.is_empty() {
            if scheduler.is_stopping_and_drained() {
                return;
            }

            let idle_scheduler = scheduler.clone();
            let fiber = IDLE_FIBER.with(|cell| cell.borrow_mut().take())
                .unwrap_or_else(|| Fiber::new(DEFAULT_STACK_SIZE, move |yielder| idle_body(idle_scheduler, yielder)));

            scheduler.counters.idle.fetch_add(1, Ordering::SeqCst);
            let fiber = unsafe { fiber.call() };
            scheduler.counters.idle.fetch_sub(1, Ordering::SeqCst);

            match fiber.state() {
                FiberState::Hold => IDLE_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber)),
                FiberState::Except => return,
                _ => unreachable!("idle fiber terminated without being cancelled"),
            }
            continue;
        }

        scheduler.counters.active.fetch_add(1, Ordering::SeqCst);
        let mut iter = batch.into_iter();
        let mut panic_payload = None;
        for item in iter.by_ref() {
            if let Err(payload) = run_one(&scheduler, item) {
                panic_payload = Some(payload);
                break;
            }
        }
        scheduler.counters.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(payload) = panic_payload {
            let leftover: Vec<QueueItem> = iter.collect();
            scheduler.requeue_front(leftover);
            weave_log!(Level::Fatal, "scheduler", "worker thread exiting after an unhandled fiber panic");
            resume_unwind(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigValue, StaticConfig};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn from_config_reads_thread_count_key() {
        let config = StaticConfig::new();
        config.set("weave.scheduler.threads", ConfigValue::Int(3));
        let scheduler = Scheduler::from_config(&config, false, 4);
        assert_eq!(scheduler.thread_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dispatch_runs_every_scheduled_thunk_once() {
        let scheduler = Scheduler::new(1, true, 1);
        scheduler.start();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = count.clone();
            let scheduler_ref = scheduler.clone();
            scheduler.schedule(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                if count.load(Ordering::SeqCst) == 50 {
                    scheduler_ref.stop();
                }
            }));
        }
        scheduler.dispatch();
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn yield_now_resumes_and_completes() {
        let scheduler = Scheduler::new(1, true, 4);
        scheduler.start();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            yield_now();
            ran_clone.fetch_add(1, Ordering::SeqCst);
            scheduler_ref.stop();
        }));
        scheduler.dispatch();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_thunk_does_not_stop_scheduler_from_stopping() {
        let scheduler = Scheduler::new(2, false, 1);
        scheduler.start();
        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            scheduler_ref.stop();
        }));
        scheduler.stop();
    }
}
